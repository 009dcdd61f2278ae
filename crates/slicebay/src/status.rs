//! Lifecycle phases and status events.

use serde::{Deserialize, Serialize};

use crate::protocol::EngineNotice;

/// Engine lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No engine loaded yet.
    #[default]
    Uninitialized,
    /// Engine loaded and idle.
    Ready,
    /// Parsing model bytes.
    Parsing,
    /// Slicing the parsed model.
    Slicing,
    /// Planning toolpaths.
    Preparing,
    /// Emitting machine code.
    Exporting,
    /// Last request finished.
    Done,
    /// Last request failed.
    Failed,
}

impl Phase {
    /// Whether a slice is currently running.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Phase::Parsing | Phase::Slicing | Phase::Preparing | Phase::Exporting
        )
    }

    /// Short label for UI display.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Uninitialized => "starting slicer",
            Phase::Ready => "ready",
            Phase::Parsing => "reading model",
            Phase::Slicing => "slicing",
            Phase::Preparing => "planning toolpaths",
            Phase::Exporting => "generating G-code",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

/// Out-of-band status event. Results never travel on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SliceStatus {
    /// The lifecycle moved to a new phase.
    Phase {
        /// New phase.
        phase: Phase,
    },
    /// The engine reported progress.
    Engine {
        /// Engine notice.
        notice: EngineNotice,
    },
    /// A request failed.
    Failed {
        /// Error message.
        message: String,
    },
}

impl SliceStatus {
    /// Overall progress estimate (0-100) implied by this event, if any.
    pub fn progress_percent(&self) -> Option<f64> {
        match self {
            SliceStatus::Phase { phase } => match phase {
                Phase::Parsing => Some(0.0),
                Phase::Slicing => Some(10.0),
                Phase::Preparing => Some(60.0),
                Phase::Exporting => Some(85.0),
                Phase::Done => Some(100.0),
                _ => None,
            },
            SliceStatus::Engine { notice } => match notice {
                EngineNotice::SliceComplete => Some(60.0),
                EngineNotice::PrepareComplete => Some(85.0),
                EngineNotice::ExportComplete => Some(100.0),
                _ => None,
            },
            SliceStatus::Failed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_phases() {
        assert!(Phase::Slicing.is_busy());
        assert!(!Phase::Ready.is_busy());
        assert!(!Phase::Done.is_busy());
    }

    #[test]
    fn test_progress_is_monotonic_through_lifecycle() {
        let phases = [
            Phase::Parsing,
            Phase::Slicing,
            Phase::Preparing,
            Phase::Exporting,
            Phase::Done,
        ];
        let progress: Vec<f64> = phases
            .iter()
            .filter_map(|&phase| SliceStatus::Phase { phase }.progress_percent())
            .collect();
        assert_eq!(progress.len(), phases.len());
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_status_json() {
        let json = serde_json::to_value(SliceStatus::Phase {
            phase: Phase::Preparing,
        })
        .unwrap();
        assert_eq!(json["kind"], "phase");
        assert_eq!(json["phase"], "preparing");
    }
}
