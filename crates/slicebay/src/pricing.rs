//! Quote estimation and user-facing failure messages.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceError};
use crate::extract::{MetricsSummary, PrintMetrics};
use crate::protocol::EngineNotice;
use crate::status::SliceStatus;

/// Weight/time price lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    /// ISO currency code, display only.
    pub currency: String,
    /// Price per gram of filament.
    pub per_gram: f64,
    /// Price per hour of machine time.
    pub per_hour: f64,
    /// Floor applied to every quote.
    pub minimum: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            currency: "USD".into(),
            per_gram: 0.03,
            per_hour: 1.5,
            minimum: 2.0,
        }
    }
}

impl PriceTable {
    /// Rates must be finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("per_gram", self.per_gram),
            ("per_hour", self.per_hour),
            ("minimum", self.minimum),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SliceError::Config(format!(
                    "pricing.{field} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Price a sliced job.
    pub fn quote(&self, metrics: &PrintMetrics) -> Quote {
        let material_cost = round_cents(metrics.material_grams * self.per_gram);
        let machine_cost = round_cents(metrics.hours() * self.per_hour);
        let total = round_cents((material_cost + machine_cost).max(self.minimum));
        Quote {
            currency: self.currency.clone(),
            metrics: metrics.summary(),
            material_cost,
            machine_cost,
            total,
        }
    }
}

fn round_cents(value: f64) -> f64 {
    if value.is_finite() {
        (value * 100.0).round() / 100.0
    } else {
        0.0
    }
}

/// A price estimate for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Currency code.
    pub currency: String,
    /// Metrics the quote is based on.
    pub metrics: MetricsSummary,
    /// Filament cost.
    pub material_cost: f64,
    /// Machine-time cost.
    pub machine_cost: f64,
    /// Amount charged.
    pub total: f64,
}

/// The three failure classes the UI renders differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The file could not be read or processed.
    UnreadableModel,
    /// The estimate could not be produced this time.
    EstimateUnavailable,
    /// The slicer itself is down.
    ServiceUnavailable,
}

impl FailureClass {
    /// Classify an orchestration error.
    pub fn of(err: &SliceError) -> Self {
        match err {
            SliceError::Parse(_) | SliceError::InvalidProfile(_) | SliceError::Io(_) => {
                FailureClass::UnreadableModel
            }
            SliceError::EngineBootstrap { .. }
            | SliceError::Handshake(_)
            | SliceError::Config(_) => FailureClass::ServiceUnavailable,
            SliceError::Slice(_)
            | SliceError::Prepare(_)
            | SliceError::Export(_)
            | SliceError::EngineSessionClosed
            | SliceError::EngineBusy
            | SliceError::UnknownEngineCall(_)
            | SliceError::Timeout(_)
            | SliceError::Protocol(_) => FailureClass::EstimateUnavailable,
        }
    }

    /// Message shown to the customer.
    pub fn message(&self) -> &'static str {
        match self {
            FailureClass::UnreadableModel => {
                "This file could not be read or processed. Check that it is a valid STL or OBJ model."
            }
            FailureClass::EstimateUnavailable => {
                "A pricing estimate is unavailable right now, please retry."
            }
            FailureClass::ServiceUnavailable => {
                "The slicing service is temporarily unavailable."
            }
        }
    }
}

/// One line of status text for a status event.
pub fn status_line(status: &SliceStatus) -> String {
    let text = match status {
        SliceStatus::Phase { phase } => phase.label().to_string(),
        SliceStatus::Engine { notice } => match notice {
            EngineNotice::Progress { fraction, .. } => {
                format!("working ({:.0}%)", (fraction * 100.0).clamp(0.0, 100.0))
            }
            EngineNotice::SliceComplete => "slice complete".into(),
            EngineNotice::PrepareComplete => "toolpaths ready".into(),
            EngineNotice::ExportComplete => "G-code ready".into(),
            EngineNotice::Log { message } => message.clone(),
        },
        SliceStatus::Failed { message } => format!("failed: {message}"),
    };
    match status.progress_percent() {
        Some(pct) => format!("[{pct:>3.0}%] {text}"),
        None => text,
    }
}
