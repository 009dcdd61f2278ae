#![warn(missing_docs)]

//! Built-in preview engine for slicebay.
//!
//! [`PreviewModule`] exports the six engine entry points and runs inside the
//! slicebay worker host like any other engine. It reads STL and OBJ models,
//! plans layers from the model bounds, estimates material and time from the
//! mesh volume, and emits G-code whose footer carries the metric markers.
//!
//! # Example
//!
//! ```ignore
//! use slicebay::{DeviceProfile, ProcessProfile, SliceRequest, Slicer, SlicerConfig};
//!
//! let slicer = Slicer::from_bundle(slicebay_preview::bundle, SlicerConfig::default());
//! let result = slicer
//!     .slice(SliceRequest::new(bytes, DeviceProfile::ender3(), ProcessProfile::default()))
//!     .await?;
//! ```

pub mod error;
pub mod estimate;
pub mod gcode;
pub mod mesh;

pub use error::{PreviewError, Result};
pub use estimate::{estimate, generate_layer_heights, plan_layers, LayerPlan, PrintEstimate};
pub use gcode::{emit, render_template};
pub use mesh::{parse_model, Bounds, Mesh, ModelFormat};

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use slicebay::{
    BootstrapScope, DeviceProfile, EngineBundle, EngineCall, EngineModule, EngineNotice,
    ProcessProfile, Request,
};

/// Label font the engine's bootstrap pulls in. Never needed for slicing.
pub const FONT_ASSET: &str = "https://cdn.slicebay.dev/fonts/helvetiker_regular.typeface.json";

/// URL fragment stubbed out while the preview engine bootstraps.
pub const FONT_PATTERN: &str = "/fonts/";

/// Engine state, reset stage by stage as earlier inputs change.
#[derive(Default)]
struct EngineState {
    device: Option<DeviceProfile>,
    process: Option<ProcessProfile>,
    mesh: Option<Mesh>,
    plan: Option<LayerPlan>,
    estimate: Option<PrintEstimate>,
}

impl EngineState {
    fn invalidate_plan(&mut self) {
        self.plan = None;
        self.estimate = None;
    }
}

type Shared = Rc<RefCell<EngineState>>;

/// The preview engine module.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewModule;

/// Bundle holding the preview engine, with its font import stubbed.
pub fn bundle() -> EngineBundle {
    EngineBundle::new().with_module(PreviewModule).stub(FONT_PATTERN)
}

fn set_device(state: &Shared, req: Request<'_>) -> Result<Value> {
    let device: DeviceProfile =
        serde_json::from_value(req.data).map_err(|e| PreviewError::Profile(e.to_string()))?;
    let name = device.name.clone();
    let mut state = state.borrow_mut();
    state.device = Some(device);
    state.invalidate_plan();
    Ok(json!({ "device": name }))
}

fn set_process(state: &Shared, req: Request<'_>) -> Result<Value> {
    let process: ProcessProfile =
        serde_json::from_value(req.data).map_err(|e| PreviewError::Profile(e.to_string()))?;
    let mut state = state.borrow_mut();
    state.process = Some(process.normalized());
    state.invalidate_plan();
    Ok(Value::Null)
}

fn parse(state: &Shared, req: Request<'_>) -> Result<Value> {
    let bytes = req.buffers.into_iter().next().unwrap_or_default();
    let mesh = parse_model(&bytes)?;
    let bounds = mesh.bounds().ok_or(PreviewError::EmptyMesh)?;

    let mut state = state.borrow_mut();
    let device = state
        .device
        .as_ref()
        .ok_or(PreviewError::OutOfOrder("kiri.api.set_device"))?;
    let [x, y, z] = bounds.size();
    if x > device.max_x || y > device.max_y || z > device.max_z {
        return Err(PreviewError::ExceedsBuildVolume {
            printer: device.name.clone(),
            x,
            y,
            z,
        });
    }

    let triangles = mesh.triangle_count();
    tracing::debug!(triangles, "model parsed");
    state.mesh = Some(mesh);
    state.invalidate_plan();
    Ok(json!({ "triangles": triangles, "bounds": bounds }))
}

fn slice(state: &Shared, req: Request<'_>) -> Result<Value> {
    let mut state = state.borrow_mut();
    let process = state
        .process
        .as_ref()
        .ok_or(PreviewError::OutOfOrder("kiri.api.set_process"))?;
    let mesh = state
        .mesh
        .as_ref()
        .ok_or(PreviewError::OutOfOrder("kiri.api.parse"))?;

    let plan = plan_layers(mesh, process)?;
    let total = plan.heights.len();
    for quarter in 1..4 {
        req.notify(EngineNotice::Progress {
            call: EngineCall::Slice.name().into(),
            fraction: quarter as f64 / 4.0,
        });
    }
    req.notify(EngineNotice::SliceComplete);

    state.plan = Some(plan);
    state.estimate = None;
    Ok(json!({ "layers": total }))
}

fn prepare(state: &Shared, req: Request<'_>) -> Result<Value> {
    let mut state = state.borrow_mut();
    let (Some(device), Some(process), Some(mesh), Some(plan)) =
        (&state.device, &state.process, &state.mesh, &state.plan)
    else {
        return Err(PreviewError::OutOfOrder("kiri.api.slice"));
    };

    let est = estimate(mesh, plan, device, process);
    req.notify(EngineNotice::PrepareComplete);
    state.estimate = Some(est);
    Ok(json!({
        "layers": est.layers,
        "time": est.time_seconds,
        "filament": est.filament_mm,
    }))
}

fn export(state: &Shared, req: Request<'_>) -> Result<Value> {
    let state = state.borrow();
    let (Some(device), Some(process), Some(plan), Some(est)) =
        (&state.device, &state.process, &state.plan, &state.estimate)
    else {
        return Err(PreviewError::OutOfOrder("kiri.api.prepare"));
    };

    let gcode = emit(device, process, plan, est);
    req.notify(EngineNotice::ExportComplete);
    Ok(Value::String(gcode))
}

impl EngineModule for PreviewModule {
    fn name(&self) -> &str {
        "slicebay-preview"
    }

    fn imports(&self) -> Vec<String> {
        vec![FONT_ASSET.into()]
    }

    fn install(&self, scope: &mut BootstrapScope<'_>) -> std::result::Result<(), String> {
        let state: Shared = Rc::default();
        let entry_points: [(EngineCall, fn(&Shared, Request<'_>) -> Result<Value>); 6] = [
            (EngineCall::SetDevice, set_device),
            (EngineCall::SetProcess, set_process),
            (EngineCall::Parse, parse),
            (EngineCall::Slice, slice),
            (EngineCall::Prepare, prepare),
            (EngineCall::Export, export),
        ];
        for (call, handler) in entry_points {
            let state = state.clone();
            scope.export(call, move |req| handler(&state, req).map_err(|e| e.to_string()));
        }
        Ok(())
    }
}
