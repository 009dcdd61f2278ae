#![warn(missing_docs)]

//! Slicing engine orchestration.
//!
//! This crate runs a slicing engine in isolation on a worker thread and
//! exposes it as an async request/response service. Model bytes and printer
//! settings go in; G-code plus print time, filament mass and layer count come
//! out.
//!
//! # Example
//!
//! ```ignore
//! use slicebay::{DeviceProfile, ProcessProfile, SliceRequest, Slicer, SlicerConfig};
//!
//! let slicer = Slicer::from_bundle(slicebay_preview::bundle, SlicerConfig::default());
//! let request = SliceRequest::new(stl_bytes, DeviceProfile::generic(), ProcessProfile::default());
//! let result = slicer.slice(request).await?;
//!
//! println!("Layers: {}", result.metrics.layers);
//! println!("Filament: {:.1}g", result.metrics.material_grams);
//! ```

pub mod config;
pub mod correlator;
pub mod error;
pub mod extract;
pub mod host;
pub mod pricing;
pub mod profile;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;

pub use config::{BusyPolicy, SlicerConfig};
pub use correlator::Correlator;
pub use error::{Result, SliceError};
pub use extract::{extract_metrics, filament_mass_grams, MetricsSummary, PrintMetrics};
pub use host::{
    BootstrapScope, BundledFetcher, EngineBundle, EngineHandle, EngineHost, EngineLauncher,
    EngineModule, Fetcher, OfflineFetcher, Request, WorkerLauncher,
};
pub use pricing::{status_line, FailureClass, PriceTable, Quote};
pub use profile::{DeviceProfile, InfillPattern, Material, ProcessProfile};
pub use protocol::{EngineCall, EngineNotice, Envelope, Reply};
pub use session::{SliceRequest, SliceResult, Slicer};
pub use status::{Phase, SliceStatus};
