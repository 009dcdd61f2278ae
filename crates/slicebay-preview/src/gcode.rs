//! G-code emission for preview slices.

use std::fmt::Write as _;

use slicebay::{DeviceProfile, Material, ProcessProfile};

use crate::estimate::{LayerPlan, PrintEstimate};

/// Nozzle and bed temperatures for a material (°C).
pub fn temperatures(material: &Material) -> (u32, u32) {
    match material {
        Material::Pla => (210, 60),
        Material::Petg => (240, 80),
        Material::Abs => (250, 100),
        Material::Asa => (255, 100),
        Material::Tpu => (225, 50),
        Material::Custom { .. } => (210, 60),
    }
}

/// Replace `{key}` placeholders. Unknown placeholders are left as-is.
pub fn render_template(template: &str, values: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Emit a preview program: header, one perimeter loop per layer, footer.
///
/// The loop traces the model's footprint and carries an even share of the
/// estimated filament, so the program's total extrusion matches the estimate.
pub fn emit(
    device: &DeviceProfile,
    process: &ProcessProfile,
    plan: &LayerPlan,
    estimate: &PrintEstimate,
) -> String {
    let (print_temp, bed_temp) = temperatures(&process.material);
    let header = render_template(
        &device.gcode_header,
        &[
            ("print_temp", print_temp.to_string()),
            ("bed_temp", bed_temp.to_string()),
        ],
    );

    let mut out = String::new();
    let _ = writeln!(out, "; generated by slicebay-preview");
    let _ = writeln!(out, "; printer {}", device.name);
    let _ = writeln!(
        out,
        "; layer height {:.2} mm, {} shells, fill {:.0}%",
        process.slice_height,
        process.slice_shell_count,
        process.slice_fill_sparse * 100.0
    );
    out.push_str(&header);
    if !header.ends_with('\n') && !header.is_empty() {
        out.push('\n');
    }
    out.push_str("G21\nG90\nM83\n");

    // Center-origin beds put (0, 0) mid-plate; the mesh is placed as-is.
    let (dx, dy) = if device.origin_center {
        (-device.max_x / 2.0, -device.max_y / 2.0)
    } else {
        (0.0, 0.0)
    };
    let [x0, y0, _] = plan.bounds.min;
    let [x1, y1, _] = plan.bounds.max;
    let corners = [(x1, y0), (x1, y1), (x0, y1), (x0, y0)];
    let per_side = if plan.heights.is_empty() {
        0.0
    } else {
        estimate.filament_mm / plan.heights.len() as f64 / corners.len() as f64
    };

    for (index, z) in plan.heights.iter().enumerate() {
        let _ = writeln!(out, ";LAYER:{index}");
        let _ = writeln!(out, "G0 X{:.3} Y{:.3} Z{:.3} F6000", x0 + dx, y0 + dy, z);
        for (x, y) in corners {
            let _ = writeln!(out, "G1 X{:.3} Y{:.3} E{:.5} F1800", x + dx, y + dy, per_side);
        }
    }

    let footer = render_template(
        &device.gcode_footer,
        &[
            ("time", format!("{:.1}", estimate.time_seconds)),
            ("material", format!("{:.1}", estimate.filament_mm)),
            ("layers", estimate.layers.to_string()),
            ("print_temp", print_temp.to_string()),
            ("bed_temp", bed_temp.to_string()),
        ],
    );
    out.push_str(&footer);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::{estimate, plan_layers};
    use crate::mesh::{parse_obj, tests::box_obj};
    use slicebay::extract_metrics;

    #[test]
    fn test_render_template() {
        let out = render_template(
            "M104 S{print_temp}\nM140 S{bed_temp} {unknown}",
            &[("print_temp", "215".into()), ("bed_temp", "60".into())],
        );
        assert_eq!(out, "M104 S215\nM140 S60 {unknown}");
    }

    #[test]
    fn test_footer_markers_read_back() {
        let mesh = parse_obj(&box_obj([20.0, 20.0, 10.0])).unwrap();
        let device = DeviceProfile::prusa_mk4();
        let process = ProcessProfile::default();
        let plan = plan_layers(&mesh, &process).unwrap();
        let est = estimate(&mesh, &plan, &device, &process);

        let gcode = emit(&device, &process, &plan, &est);
        assert!(gcode.contains("M104 S210"));
        assert!(!gcode.contains("{print_temp}"));
        assert_eq!(gcode.matches(";LAYER:").count(), plan.heights.len());

        let metrics = extract_metrics(&gcode, device.filament_diameter, process.material.density());
        assert_eq!(metrics.layers, est.layers);
        assert!((metrics.time_seconds - est.time_seconds).abs() < 0.05);
        assert!((metrics.filament_mm - est.filament_mm).abs() < 0.05);
    }

    #[test]
    fn test_center_origin_offsets_moves() {
        let mesh = parse_obj(&box_obj([10.0, 10.0, 1.0])).unwrap();
        let device = DeviceProfile::voron_24();
        let process = ProcessProfile::default();
        let plan = plan_layers(&mesh, &process).unwrap();
        let est = estimate(&mesh, &plan, &device, &process);
        let gcode = emit(&device, &process, &plan, &est);
        assert!(gcode.contains("G0 X-175.000 Y-175.000"));
    }
}
