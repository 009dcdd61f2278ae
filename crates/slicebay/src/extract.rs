//! Metrics recovered from exported G-code.
//!
//! Device footers echo the engine's estimates back as comment markers, e.g.
//!
//! ```text
//! ; time=5412.0
//! ; material=8231.7
//! ; layers=142
//! ```
//!
//! Scanning is tolerant: a missing or garbled field reads as zero, and
//! negative or non-finite values are clamped to zero, so pricing always has
//! a finite, non-negative number to work with.

use std::f64::consts::PI;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static MARKER: OnceLock<Regex> = OnceLock::new();

fn marker() -> &'static Regex {
    MARKER.get_or_init(|| {
        Regex::new(
            r"(?i)\b(print_time|time|filament_used|filament|material|layer_count|layers)\s*[=:]\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:e[-+]?\d+)?|nan|[-+]?inf(?:inity)?)",
        )
        .expect("marker pattern is valid")
    })
}

/// Values read straight from the markers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RawMetrics {
    /// Estimated print time (s).
    pub time_seconds: f64,
    /// Extruded filament length (mm).
    pub filament_mm: f64,
    /// Layer count.
    pub layers: u32,
}

/// Metrics after unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PrintMetrics {
    /// Estimated print time (s).
    pub time_seconds: f64,
    /// Extruded filament length (mm).
    pub filament_mm: f64,
    /// Estimated filament mass (g).
    pub material_grams: f64,
    /// Layer count.
    pub layers: u32,
}

/// Consumer-facing shape: `{ time, material, layers }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Seconds.
    pub time: f64,
    /// Grams.
    pub material: f64,
    /// Layer count.
    pub layers: u32,
}

impl PrintMetrics {
    /// Consumer-facing summary.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            time: self.time_seconds,
            material: self.material_grams,
            layers: self.layers,
        }
    }

    /// Print time in hours.
    pub fn hours(&self) -> f64 {
        self.time_seconds / 3600.0
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn parse_number(text: &str) -> f64 {
    finite_or_zero(text.parse::<f64>().unwrap_or(0.0))
}

/// Scan output for metric markers. The last occurrence of each field wins.
pub fn scan_markers(output: &str) -> RawMetrics {
    let mut raw = RawMetrics::default();
    for caps in marker().captures_iter(output) {
        let value = parse_number(&caps[2]);
        match caps[1].to_ascii_lowercase().as_str() {
            "time" | "print_time" => raw.time_seconds = value,
            "material" | "filament" | "filament_used" => raw.filament_mm = value,
            _ => raw.layers = value.floor().min(u32::MAX as f64) as u32,
        }
    }
    raw
}

/// Mass of `length_mm` of filament: `π·(d/2)²·L / 1000 · ρ`.
pub fn filament_mass_grams(length_mm: f64, diameter_mm: f64, density_g_cm3: f64) -> f64 {
    let radius = finite_or_zero(diameter_mm) / 2.0;
    let volume_mm3 = PI * radius * radius * finite_or_zero(length_mm);
    finite_or_zero(volume_mm3 / 1000.0 * finite_or_zero(density_g_cm3))
}

/// Scan output and convert filament length to grams.
pub fn extract_metrics(output: &str, filament_diameter_mm: f64, density_g_cm3: f64) -> PrintMetrics {
    let raw = scan_markers(output);
    PrintMetrics {
        time_seconds: raw.time_seconds,
        filament_mm: raw.filament_mm,
        material_grams: filament_mass_grams(raw.filament_mm, filament_diameter_mm, density_g_cm3),
        layers: raw.layers,
    }
}
