//! Error types for the preview engine.

use thiserror::Error;

/// Errors raised by preview engine entry points.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreviewError {
    /// Model has no triangles.
    #[error("mesh is empty")]
    EmptyMesh,

    /// Bytes are neither STL nor OBJ.
    #[error("unrecognized model format")]
    UnknownFormat,

    /// Model text could not be parsed.
    #[error("malformed model at line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What was wrong.
        reason: String,
    },

    /// Binary STL ended before its declared face count.
    #[error("binary STL truncated: expected {expected} triangles, found {got}")]
    Truncated {
        /// Declared triangle count.
        expected: u32,
        /// Complete triangles present.
        got: u32,
    },

    /// Model does not fit the configured printer.
    #[error("model ({x:.1} x {y:.1} x {z:.1} mm) exceeds the build volume of {printer}")]
    ExceedsBuildVolume {
        /// Printer name.
        printer: String,
        /// Model extent X (mm).
        x: f64,
        /// Model extent Y (mm).
        y: f64,
        /// Model extent Z (mm).
        z: f64,
    },

    /// Model is too thin for a single layer.
    #[error("model too thin to slice")]
    TooThin,

    /// Layer height would produce an unbounded layer count.
    #[error("layer height {layer_height} mm needs more than {limit} layers")]
    TooManyLayers {
        /// Requested layer height (mm).
        layer_height: f64,
        /// Layer cap.
        limit: usize,
    },

    /// A call arrived before the state it depends on.
    #[error("{0} must run first")]
    OutOfOrder(&'static str),

    /// Profile payload could not be decoded.
    #[error("bad profile: {0}")]
    Profile(String),
}

/// Result type for preview engine operations.
pub type Result<T> = std::result::Result<T, PreviewError>;
