//! Layer planning and print estimates.
//!
//! The preview engine does not generate real toolpaths. It plans layer
//! heights from the model's bounds and estimates extruded volume from the
//! mesh's surface area and volume: shells follow the surface, infill fills
//! the rest at the configured density.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use slicebay::{DeviceProfile, ProcessProfile};

use crate::error::{PreviewError, Result};
use crate::mesh::{Bounds, Mesh};

/// First layer height as a multiple of the regular layer height.
pub const FIRST_LAYER_FACTOR: f64 = 1.25;

/// Average print speed including travel (mm/s).
pub const PRINT_SPEED_MM_S: f64 = 60.0;

/// Extrusion width as a multiple of nozzle diameter.
pub const LINE_WIDTH_FACTOR: f64 = 1.125;

/// Support density relative to the space under the model's footprint.
pub const SUPPORT_DENSITY: f64 = 0.15;

/// Output of the slice step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPlan {
    /// Layer center heights (mm), bottom to top.
    pub heights: Vec<f64>,
    /// Model bounds.
    pub bounds: Bounds,
}

/// Output of the prepare step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrintEstimate {
    /// Layer count.
    pub layers: u32,
    /// Extruded plastic volume (mm³).
    pub extruded_mm3: f64,
    /// Filament length fed (mm).
    pub filament_mm: f64,
    /// Estimated print time (s).
    pub time_seconds: f64,
}

/// Upper bound on planned layers; anything above is a degenerate profile.
pub const MAX_LAYERS: usize = 100_000;

/// Generate layer heights for slicing.
///
/// The count is computed up front so a tiny layer height fails fast instead
/// of accumulating heights until memory runs out.
pub fn generate_layer_heights(
    z_min: f64,
    z_max: f64,
    first_layer_height: f64,
    layer_height: f64,
) -> Result<Vec<f64>> {
    if z_max <= z_min || !layer_height.is_finite() || layer_height <= 0.0 {
        return Ok(Vec::new());
    }

    let first_z = z_min + first_layer_height / 2.0;
    let start = z_min + first_layer_height + layer_height / 2.0;
    let first = usize::from(first_z <= z_max);
    let rest = if start <= z_max {
        ((z_max - start) / layer_height + 1e-9).floor() + 1.0
    } else {
        0.0
    };
    if !rest.is_finite() || rest >= MAX_LAYERS as f64 {
        return Err(PreviewError::TooManyLayers {
            layer_height,
            limit: MAX_LAYERS,
        });
    }

    let rest = rest as usize;
    let mut heights = Vec::with_capacity(first + rest);
    if first == 1 {
        heights.push(first_z);
    }
    heights.extend((0..rest).map(|k| start + k as f64 * layer_height));
    Ok(heights)
}

/// Plan layers for `mesh`.
pub fn plan_layers(mesh: &Mesh, process: &ProcessProfile) -> Result<LayerPlan> {
    let bounds = mesh.bounds().ok_or(PreviewError::EmptyMesh)?;
    let heights = generate_layer_heights(
        bounds.min[2],
        bounds.max[2],
        process.slice_height * FIRST_LAYER_FACTOR,
        process.slice_height,
    )?;
    if heights.is_empty() {
        return Err(PreviewError::TooThin);
    }
    Ok(LayerPlan { heights, bounds })
}

/// Estimate material and time for a planned model.
pub fn estimate(
    mesh: &Mesh,
    plan: &LayerPlan,
    device: &DeviceProfile,
    process: &ProcessProfile,
) -> PrintEstimate {
    let line_width = device.nozzle_size * LINE_WIDTH_FACTOR;
    let volume = mesh.volume();

    let shells = (mesh.surface_area() * line_width * process.slice_shell_count as f64).min(volume);
    let infill = (volume - shells).max(0.0) * process.slice_fill_sparse.clamp(0.0, 1.0);
    let support = if process.slice_support_enable {
        let [x, y, z] = plan.bounds.size();
        (x * y * z - volume).max(0.0) * SUPPORT_DENSITY
    } else {
        0.0
    };
    let extruded_mm3 = shells + infill + support;

    // Rough: path length at a fixed average speed.
    let path_length = extruded_mm3 / (line_width * process.slice_height);
    let time_seconds = path_length / PRINT_SPEED_MM_S;

    let filament_area = PI * (device.filament_diameter / 2.0).powi(2);
    let filament_mm = if filament_area > 0.0 {
        extruded_mm3 / filament_area
    } else {
        0.0
    };

    PrintEstimate {
        layers: plan.heights.len() as u32,
        extruded_mm3,
        filament_mm,
        time_seconds,
    }
}
