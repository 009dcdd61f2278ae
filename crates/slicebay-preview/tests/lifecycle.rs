//! End-to-end: the preview engine behind the slicebay session controller.

use std::time::Duration;

use slicebay::{
    DeviceProfile, FailureClass, Material, Phase, PriceTable, ProcessProfile, SliceError,
    SliceRequest, SliceStatus, Slicer, SlicerConfig,
};

fn cube(size: f64) -> Vec<u8> {
    format!(
        "v 0 0 0\nv {s} 0 0\nv {s} {s} 0\nv 0 {s} 0\n\
         v 0 0 {s}\nv {s} 0 {s}\nv {s} {s} {s}\nv 0 {s} {s}\n\
         f 1 3 2\nf 1 4 3\nf 5 6 7\nf 5 7 8\nf 1 2 6\nf 1 6 5\n\
         f 3 4 8\nf 3 8 7\nf 1 5 8\nf 1 8 4\nf 2 3 7\nf 2 7 6\n",
        s = size
    )
    .into_bytes()
}

fn slicer() -> Slicer {
    Slicer::from_bundle(slicebay_preview::bundle, SlicerConfig::default())
}

#[tokio::test]
async fn test_slice_and_quote() {
    let slicer = slicer();
    let mut status = slicer.subscribe_status();

    let request = SliceRequest::new(cube(20.0), DeviceProfile::prusa_mk4(), ProcessProfile::default());
    let result = slicer.slice(request).await.unwrap();

    assert_eq!(result.metrics.layers, 100);
    assert!(result.metrics.time_seconds > 0.0);
    assert!(result.metrics.material_grams > 0.0);
    assert!(result.gcode.starts_with("; generated by slicebay-preview"));

    let quote = PriceTable::default().quote(&result.metrics);
    assert!(quote.total >= PriceTable::default().minimum);
    assert_eq!(quote.metrics.layers, 100);

    let mut seen = Vec::new();
    while let Ok(event) = status.try_recv() {
        seen.push(event);
    }
    let phases: Vec<Phase> = seen
        .iter()
        .filter_map(|s| match s {
            SliceStatus::Phase { phase } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        [
            Phase::Ready,
            Phase::Parsing,
            Phase::Slicing,
            Phase::Preparing,
            Phase::Exporting,
            Phase::Done,
            Phase::Ready
        ]
    );
}

#[tokio::test]
async fn test_material_changes_mass_not_length() {
    let slicer = slicer();
    let pla = slicer
        .slice(SliceRequest::new(cube(15.0), DeviceProfile::generic(), ProcessProfile::default()))
        .await
        .unwrap();
    let abs = slicer
        .slice(SliceRequest::new(
            cube(15.0),
            DeviceProfile::generic(),
            ProcessProfile {
                material: Material::Abs,
                ..Default::default()
            },
        ))
        .await
        .unwrap();

    assert_eq!(pla.metrics.filament_mm, abs.metrics.filament_mm);
    let ratio = abs.metrics.material_grams / pla.metrics.material_grams;
    assert!((ratio - 1.04 / 1.24).abs() < 1e-6);
}

#[tokio::test]
async fn test_unreadable_model() {
    let slicer = slicer();
    let err = slicer
        .slice(SliceRequest::new(
            b"not a model".to_vec(),
            DeviceProfile::generic(),
            ProcessProfile::default(),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SliceError::Parse(_)));
    assert_eq!(FailureClass::of(&err), FailureClass::UnreadableModel);

    // The session survives a rejected model.
    let ok = slicer
        .slice_with_timeout(
            SliceRequest::new(cube(5.0), DeviceProfile::generic(), ProcessProfile::default()),
            Duration::from_secs(10),
        )
        .await;
    assert!(ok.is_ok());
}

#[tokio::test]
async fn test_configure_then_slice_file_twice() {
    let slicer = slicer();
    slicer
        .configure(DeviceProfile::ender3(), ProcessProfile::default())
        .await
        .unwrap();
    let (a, b) = tokio::join!(slicer.slice_file(cube(10.0)), slicer.slice_file(cube(20.0)));
    assert_eq!(a.unwrap().metrics.layers, 50);
    assert_eq!(b.unwrap().metrics.layers, 100);
}
