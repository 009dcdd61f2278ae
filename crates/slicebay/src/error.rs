//! Error types for slicing orchestration.

use thiserror::Error;

use crate::status::Phase;

/// Errors surfaced by the engine host, the correlator and the lifecycle controller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SliceError {
    /// Engine modules failed to load, or a required entry point is missing.
    #[error("engine bootstrap failed: missing or broken `{symbol}`: {reason}")]
    EngineBootstrap {
        /// Entry point or module name that could not be loaded.
        symbol: String,
        /// What went wrong.
        reason: String,
    },

    /// The engine session was torn down while the call was in flight.
    #[error("engine session closed")]
    EngineSessionClosed,

    /// The engine rejected the model during parsing.
    #[error("parse failed: {0}")]
    Parse(String),

    /// The engine failed to slice the parsed model.
    #[error("slice failed: {0}")]
    Slice(String),

    /// The engine failed to prepare toolpaths.
    #[error("prepare failed: {0}")]
    Prepare(String),

    /// The engine failed to export machine code.
    #[error("export failed: {0}")]
    Export(String),

    /// Another slice is in flight and the session rejects concurrent work.
    #[error("engine busy: another slice is in flight")]
    EngineBusy,

    /// An envelope named a function the protocol does not know.
    #[error("unknown engine call: {0}")]
    UnknownEngineCall(String),

    /// Device or process profile failed validation.
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    /// The engine did not complete the init handshake.
    #[error("engine handshake failed: {0}")]
    Handshake(String),

    /// A caller-side deadline expired; the session has been torn down.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// A reply payload could not be decoded, or a non-phase call failed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// IO error (message only, so the error stays cloneable).
    #[error("IO error: {0}")]
    Io(String),
}

impl SliceError {
    /// Tag an engine-side failure with the lifecycle phase that produced it.
    pub fn in_phase(phase: Phase, message: impl Into<String>) -> Self {
        let message = message.into();
        match phase {
            Phase::Parsing => Self::Parse(message),
            Phase::Slicing => Self::Slice(message),
            Phase::Preparing => Self::Prepare(message),
            Phase::Exporting => Self::Export(message),
            _ => Self::Protocol(message),
        }
    }

    /// The lifecycle phase this error is tagged with, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Parse(_) => Some(Phase::Parsing),
            Self::Slice(_) => Some(Phase::Slicing),
            Self::Prepare(_) => Some(Phase::Preparing),
            Self::Export(_) => Some(Phase::Exporting),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SliceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, SliceError>;
