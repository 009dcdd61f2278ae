//! Device and process profiles handed to the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceError};

/// Largest nozzle the orchestrator accepts (mm).
pub const MAX_NOZZLE_MM: f64 = 2.0;

/// Default filament diameter (mm).
pub const DEFAULT_FILAMENT_MM: f64 = 1.75;

/// Footer echoed back by every built-in device; the extractor reads these markers.
pub const METRICS_FOOTER: &str = "; time={time}\n; material={material}\n; layers={layers}\n";

/// Printer description, consumed verbatim by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Profile name.
    pub name: String,
    /// Build volume X (mm).
    pub max_x: f64,
    /// Build volume Y (mm).
    pub max_y: f64,
    /// Build volume Z (mm).
    pub max_z: f64,
    /// Bed origin is the plate center rather than the front-left corner.
    #[serde(default)]
    pub origin_center: bool,
    /// Nozzle diameter (mm).
    pub nozzle_size: f64,
    /// Filament diameter (mm).
    #[serde(default = "default_filament")]
    pub filament_diameter: f64,
    /// Start G-code template.
    #[serde(default)]
    pub gcode_header: String,
    /// End G-code template. Should echo `{time}`, `{material}` and `{layers}`.
    #[serde(default = "default_footer")]
    pub gcode_footer: String,
}

fn default_filament() -> f64 {
    DEFAULT_FILAMENT_MM
}

fn default_footer() -> String {
    METRICS_FOOTER.into()
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::generic()
    }
}

impl DeviceProfile {
    /// Generic Marlin-style printer.
    pub fn generic() -> Self {
        Self {
            name: "Generic".into(),
            max_x: 220.0,
            max_y: 220.0,
            max_z: 250.0,
            origin_center: false,
            nozzle_size: 0.4,
            filament_diameter: DEFAULT_FILAMENT_MM,
            gcode_header: "G28 ; home all axes\n\
                           M104 S{print_temp}\n\
                           M140 S{bed_temp}\n\
                           M109 S{print_temp}\n\
                           M190 S{bed_temp}\n\
                           G92 E0\n"
                .into(),
            gcode_footer: format!("M104 S0\nM140 S0\nG91\nG1 Z10 F3000\nG90\nM84\n{METRICS_FOOTER}"),
        }
    }

    /// Bambu Lab X1 Carbon.
    pub fn bambu_x1c() -> Self {
        Self {
            name: "Bambu Lab X1 Carbon".into(),
            max_x: 256.0,
            max_y: 256.0,
            max_z: 256.0,
            gcode_header: "M400\nG28 X\nM109 S{print_temp}\nM190 S{bed_temp}\nG28\n".into(),
            ..Self::generic()
        }
    }

    /// Prusa MK4.
    pub fn prusa_mk4() -> Self {
        Self {
            name: "Prusa MK4".into(),
            max_x: 250.0,
            max_y: 210.0,
            max_z: 220.0,
            ..Self::generic()
        }
    }

    /// Creality Ender 3.
    pub fn ender3() -> Self {
        Self {
            name: "Creality Ender 3".into(),
            max_x: 220.0,
            max_y: 220.0,
            max_z: 250.0,
            ..Self::generic()
        }
    }

    /// Voron 2.4 (350mm), center origin.
    pub fn voron_24() -> Self {
        Self {
            name: "Voron 2.4 (350mm)".into(),
            max_x: 350.0,
            max_y: 350.0,
            max_z: 340.0,
            origin_center: true,
            ..Self::generic()
        }
    }

    /// All built-in presets.
    pub fn all_profiles() -> Vec<Self> {
        vec![
            Self::generic(),
            Self::bambu_x1c(),
            Self::prusa_mk4(),
            Self::ender3(),
            Self::voron_24(),
        ]
    }

    /// Find a preset by case-insensitive substring of its name.
    pub fn find(name: &str) -> Option<Self> {
        let needle = name.to_lowercase();
        Self::all_profiles()
            .into_iter()
            .find(|p| p.name.to_lowercase().contains(&needle))
    }

    /// Validate dimensions.
    pub fn validate(&self) -> Result<()> {
        let dims = [
            ("max_x", self.max_x),
            ("max_y", self.max_y),
            ("max_z", self.max_z),
            ("nozzle_size", self.nozzle_size),
            ("filament_diameter", self.filament_diameter),
        ];
        for (field, value) in dims {
            if !value.is_finite() || value <= 0.0 {
                return Err(SliceError::InvalidProfile(format!(
                    "{field} must be positive, got {value}"
                )));
            }
        }
        if self.nozzle_size > MAX_NOZZLE_MM {
            return Err(SliceError::InvalidProfile(format!(
                "nozzle_size {} exceeds {MAX_NOZZLE_MM}mm",
                self.nozzle_size
            )));
        }
        Ok(())
    }
}

/// Infill pattern names understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfillPattern {
    /// Rectilinear grid.
    #[default]
    Grid,
    /// Alternating diagonal lines.
    Lines,
    /// Triangular pattern.
    Triangles,
    /// Gyroid.
    Gyroid,
    /// Hexagonal honeycomb.
    Honeycomb,
}

impl FromStr for InfillPattern {
    type Err = SliceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "lines" | "linear" => Ok(Self::Lines),
            "triangles" => Ok(Self::Triangles),
            "gyroid" => Ok(Self::Gyroid),
            "honeycomb" | "hex" => Ok(Self::Honeycomb),
            other => Err(SliceError::InvalidProfile(format!(
                "unknown infill pattern `{other}`"
            ))),
        }
    }
}

/// Filament material; selects the density used for mass estimates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Material {
    /// Polylactic acid.
    #[default]
    Pla,
    /// PETG.
    Petg,
    /// ABS.
    Abs,
    /// ASA.
    Asa,
    /// Flexible TPU.
    Tpu,
    /// Anything else, with an explicit density.
    Custom {
        /// Density in g/cm³.
        density: f64,
    },
}

impl Material {
    /// Density in g/cm³.
    pub fn density(&self) -> f64 {
        match self {
            Material::Pla => 1.24,
            Material::Petg => 1.27,
            Material::Abs => 1.04,
            Material::Asa => 1.07,
            Material::Tpu => 1.21,
            Material::Custom { density } => *density,
        }
    }
}

impl fmt::Display for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Material::Pla => f.write_str("PLA"),
            Material::Petg => f.write_str("PETG"),
            Material::Abs => f.write_str("ABS"),
            Material::Asa => f.write_str("ASA"),
            Material::Tpu => f.write_str("TPU"),
            Material::Custom { density } => write!(f, "custom ({density} g/cm³)"),
        }
    }
}

impl FromStr for Material {
    type Err = SliceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pla" => Ok(Self::Pla),
            "petg" => Ok(Self::Petg),
            "abs" => Ok(Self::Abs),
            "asa" => Ok(Self::Asa),
            "tpu" => Ok(Self::Tpu),
            other => other
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|density| Self::Custom { density })
                .ok_or_else(|| SliceError::InvalidProfile(format!("unknown material `{other}`"))),
        }
    }
}

/// Print settings, consumed verbatim by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessProfile {
    /// Layer height (mm).
    pub slice_height: f64,
    /// Number of perimeter walls.
    pub slice_shell_count: u32,
    /// Sparse infill density (0.0 to 1.0).
    pub slice_fill_sparse: f64,
    /// Sparse infill pattern.
    pub slice_fill_type: InfillPattern,
    /// Generate support structures.
    pub slice_support_enable: bool,
    /// Filament material.
    #[serde(default)]
    pub material: Material,
}

impl Default for ProcessProfile {
    fn default() -> Self {
        Self {
            slice_height: 0.2,
            slice_shell_count: 3,
            slice_fill_sparse: 0.15,
            slice_fill_type: InfillPattern::Grid,
            slice_support_enable: false,
            material: Material::Pla,
        }
    }
}

/// Thinnest layer accepted (mm).
pub const MIN_LAYER_HEIGHT_MM: f64 = 0.01;

/// Thickest layer accepted, as a fraction of the nozzle diameter.
pub const MAX_LAYER_NOZZLE_RATIO: f64 = 0.8;

impl ProcessProfile {
    /// Copy with infill density clamped into `[0, 1]`.
    pub fn normalized(&self) -> Self {
        let fill = if self.slice_fill_sparse.is_finite() {
            self.slice_fill_sparse.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            slice_fill_sparse: fill,
            ..self.clone()
        }
    }

    /// Validate settings on their own.
    pub fn validate(&self) -> Result<()> {
        if !self.slice_height.is_finite() || self.slice_height < MIN_LAYER_HEIGHT_MM {
            return Err(SliceError::InvalidProfile(format!(
                "slice_height must be at least {MIN_LAYER_HEIGHT_MM}mm"
            )));
        }
        let density = self.material.density();
        if !density.is_finite() || density <= 0.0 {
            return Err(SliceError::InvalidProfile(
                "material density must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Validate settings against the printer they will run on.
    pub fn validate_for(&self, device: &DeviceProfile) -> Result<()> {
        self.validate()?;
        let max = device.nozzle_size * MAX_LAYER_NOZZLE_RATIO;
        if self.slice_height > max {
            return Err(SliceError::InvalidProfile(format!(
                "slice_height {}mm exceeds {max:.2}mm for a {}mm nozzle",
                self.slice_height, device.nozzle_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        for profile in DeviceProfile::all_profiles() {
            assert!(profile.validate().is_ok(), "{}", profile.name);
            assert!(profile.gcode_footer.contains("{material}"));
        }
    }

    #[test]
    fn test_find_profile() {
        assert_eq!(DeviceProfile::find("mk4").unwrap().name, "Prusa MK4");
        assert!(DeviceProfile::find("nonexistent").is_none());
    }

    #[test]
    fn test_invalid_device() {
        let device = DeviceProfile {
            nozzle_size: 3.0,
            ..DeviceProfile::generic()
        };
        assert!(device.validate().is_err());

        let device = DeviceProfile {
            max_z: 0.0,
            ..DeviceProfile::generic()
        };
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_layer_height_vs_nozzle() {
        let device = DeviceProfile::generic();
        let process = ProcessProfile {
            slice_height: 0.4,
            ..Default::default()
        };
        assert!(process.validate().is_ok());
        assert!(process.validate_for(&device).is_err());
        assert!(ProcessProfile::default().validate_for(&device).is_ok());

        let almost_nozzle = ProcessProfile {
            slice_height: 0.39,
            ..Default::default()
        };
        assert!(almost_nozzle.validate_for(&device).is_err());
        let at_limit = ProcessProfile {
            slice_height: 0.32,
            ..Default::default()
        };
        assert!(at_limit.validate_for(&device).is_ok());
    }

    #[test]
    fn test_layer_height_floor() {
        for height in [1e-9, 0.005, 0.0, -0.2, f64::NAN] {
            let process = ProcessProfile {
                slice_height: height,
                ..Default::default()
            };
            assert!(process.validate().is_err(), "{height}");
        }
        let thinnest = ProcessProfile {
            slice_height: MIN_LAYER_HEIGHT_MM,
            ..Default::default()
        };
        assert!(thinnest.validate_for(&DeviceProfile::generic()).is_ok());
    }

    #[test]
    fn test_fill_clamped() {
        let process = ProcessProfile {
            slice_fill_sparse: 1.7,
            ..Default::default()
        };
        assert_eq!(process.normalized().slice_fill_sparse, 1.0);

        let process = ProcessProfile {
            slice_fill_sparse: -0.2,
            ..Default::default()
        };
        assert_eq!(process.normalized().slice_fill_sparse, 0.0);
    }

    #[test]
    fn test_material_parse() {
        assert_eq!("PETG".parse::<Material>().unwrap(), Material::Petg);
        assert_eq!(
            "1.3".parse::<Material>().unwrap(),
            Material::Custom { density: 1.3 }
        );
        assert!("wood".parse::<Material>().is_err());
        assert!("-1".parse::<Material>().is_err());
    }

    #[test]
    fn test_wire_names() {
        let json = serde_json::to_value(ProcessProfile::default()).unwrap();
        assert_eq!(json["slice_fill_type"], "grid");
        assert_eq!(json["material"], "pla");
    }
}
