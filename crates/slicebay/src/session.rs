//! Engine lifecycle controller.
//!
//! A [`Slicer`] owns at most one live engine session. The session is started
//! lazily, handshakes with `init`/`init_done`, and then serves composite
//! slice requests one at a time:
//!
//! ```text
//! set_device + set_process -> parse -> slice -> prepare -> export
//! ```
//!
//! Each phase waits for the previous one; the first rejection ends the
//! request with an error tagged by phase. Progress is published on a
//! broadcast status stream, separate from the returned result.
//!
//! The engine has no abort message. A request that times out tears the
//! session down, and the next request starts a fresh engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;

use crate::config::{BusyPolicy, SlicerConfig};
use crate::correlator::Correlator;
use crate::error::{Result, SliceError};
use crate::extract::{extract_metrics, PrintMetrics};
use crate::host::{EngineBundle, EngineLauncher, WorkerLauncher};
use crate::profile::{DeviceProfile, ProcessProfile};
use crate::protocol::{EngineCall, EngineNotice, Reply};
use crate::status::{Phase, SliceStatus};
use crate::transport::TransportReceiver;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Input bundle for one slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceRequest {
    /// Raw STL or OBJ bytes.
    pub model: Vec<u8>,
    /// Printer to slice for.
    pub device: DeviceProfile,
    /// Print settings.
    pub process: ProcessProfile,
}

impl SliceRequest {
    /// Bundle model bytes with profiles.
    pub fn new(model: Vec<u8>, device: DeviceProfile, process: ProcessProfile) -> Self {
        Self {
            model,
            device,
            process,
        }
    }
}

/// Output of a successful slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceResult {
    /// Exported machine code.
    pub gcode: String,
    /// Metrics recovered from the machine code.
    pub metrics: PrintMetrics,
}

#[derive(Debug, Clone)]
struct Configured {
    device: DeviceProfile,
    process: ProcessProfile,
}

/// One running engine plus its correlation state.
struct EngineSession {
    correlator: Arc<Correlator>,
    status_tx: broadcast::Sender<SliceStatus>,
    phase: Mutex<Phase>,
    last_error: Mutex<Option<SliceError>>,
    configured: Mutex<Option<Configured>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EngineSession {
    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
        tracing::debug!(?phase, "lifecycle phase");
        let _ = self.status_tx.send(SliceStatus::Phase { phase });
    }

    fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    fn last_error(&self) -> Option<SliceError> {
        lock(&self.last_error).clone()
    }

    fn fail(&self, err: SliceError) -> SliceError {
        tracing::warn!(error = %err, "slice request failed");
        *lock(&self.last_error) = Some(err.clone());
        let _ = self.status_tx.send(SliceStatus::Failed {
            message: err.to_string(),
        });
        self.set_phase(Phase::Failed);
        self.set_phase(Phase::Ready);
        err
    }

    fn is_closed(&self) -> bool {
        self.correlator.is_closed()
    }

    fn close(&self) {
        let abandoned = self.correlator.abandon_all();
        if abandoned > 0 {
            tracing::info!(abandoned, "engine session closed with calls in flight");
        }
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.abort();
        }
        *lock(&self.phase) = Phase::Uninitialized;
    }

    /// Configure the engine. Unconfigured until both profiles are acknowledged.
    async fn configure(&self, device: DeviceProfile, process: ProcessProfile) -> Result<()> {
        *lock(&self.configured) = None;
        match self.send_profiles(&device, process).await {
            Ok(process) => {
                tracing::debug!(device = %device.name, "engine configured");
                *lock(&self.configured) = Some(Configured { device, process });
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn send_profiles(
        &self,
        device: &DeviceProfile,
        process: ProcessProfile,
    ) -> Result<ProcessProfile> {
        device.validate()?;
        process.validate_for(device)?;
        let process = process.normalized();

        let device_json =
            serde_json::to_value(device).map_err(|e| SliceError::Protocol(e.to_string()))?;
        let process_json =
            serde_json::to_value(&process).map_err(|e| SliceError::Protocol(e.to_string()))?;

        let (device_reply, process_reply) = tokio::join!(
            self.correlator.call(EngineCall::SetDevice, device_json, Vec::new()),
            self.correlator.call(EngineCall::SetProcess, process_json, Vec::new()),
        );
        let rejected = |what: &str, message: String| {
            SliceError::InvalidProfile(format!("engine rejected {what} profile: {message}"))
        };
        device_reply?
            .into_result()
            .map_err(|m| rejected("device", m))?;
        process_reply?
            .into_result()
            .map_err(|m| rejected("process", m))?;
        Ok(process)
    }

    async fn run_phases(&self, model: Vec<u8>) -> Result<SliceResult> {
        let configured = lock(&self.configured)
            .clone()
            .ok_or_else(|| SliceError::InvalidProfile("configure must run before slicing".into()))?;

        let steps = [
            (Phase::Parsing, EngineCall::Parse),
            (Phase::Slicing, EngineCall::Slice),
            (Phase::Preparing, EngineCall::Prepare),
            (Phase::Exporting, EngineCall::Export),
        ];

        let model_size = model.len();
        let mut buffers = vec![model];
        let mut output = Value::Null;
        for (phase, call) in steps {
            self.set_phase(phase);
            let data = match call {
                EngineCall::Parse => json!({ "size": model_size }),
                _ => Value::Null,
            };
            match self
                .correlator
                .call(call, data, std::mem::take(&mut buffers))
                .await
            {
                Ok(Reply::Ok(value)) => output = value,
                Ok(Reply::Err(message)) => return Err(self.fail(SliceError::in_phase(phase, message))),
                Err(err) => return Err(self.fail(err)),
            }
        }

        let gcode = match output {
            Value::String(text) => text,
            Value::Object(mut fields) => match fields.remove("gcode") {
                Some(Value::String(text)) => text,
                _ => String::new(),
            },
            _ => String::new(),
        };
        if gcode.is_empty() {
            tracing::warn!("engine exported no machine code; metrics will be zero");
        }

        let metrics = extract_metrics(
            &gcode,
            configured.device.filament_diameter,
            configured.process.material.density(),
        );
        *lock(&self.last_error) = None;
        self.set_phase(Phase::Done);
        self.set_phase(Phase::Ready);
        Ok(SliceResult { gcode, metrics })
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.close();
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                tracing::debug!("detaching engine worker");
            }
        }
    }
}

/// Route inbound envelopes until the engine hangs up.
async fn dispatch(
    mut inbound: TransportReceiver,
    correlator: Arc<Correlator>,
    status_tx: broadcast::Sender<SliceStatus>,
    mut ready: Option<oneshot::Sender<Value>>,
) {
    while let Some(envelope) = inbound.recv().await {
        match envelope.call() {
            Ok(EngineCall::Ack) => {
                correlator.resolve(envelope.seq, envelope.data);
            }
            Ok(EngineCall::InitDone) => match ready.take() {
                Some(tx) => {
                    let _ = tx.send(envelope.data);
                }
                None => tracing::debug!("ignoring repeated init_done"),
            },
            Ok(EngineCall::Status) => match serde_json::from_value::<EngineNotice>(envelope.data) {
                Ok(notice) => {
                    let _ = status_tx.send(SliceStatus::Engine { notice });
                }
                Err(err) => tracing::warn!(error = %err, "malformed engine status"),
            },
            Ok(other) => tracing::warn!(call = %other, "unexpected message from engine"),
            Err(err) => tracing::warn!(error = %err, "dropping envelope"),
        }
    }
    tracing::debug!("engine transport closed");
    correlator.abandon_all();
}

struct Inner {
    launcher: Arc<dyn EngineLauncher>,
    config: SlicerConfig,
    init_lock: AsyncMutex<()>,
    run_lock: AsyncMutex<()>,
    current: Mutex<Option<Arc<EngineSession>>>,
    status_tx: broadcast::Sender<SliceStatus>,
}

/// Promise-style front end for a slicing engine.
///
/// Cloning is cheap; clones share the same engine session and queue.
#[derive(Clone)]
pub struct Slicer {
    inner: Arc<Inner>,
}

impl Slicer {
    /// Create a slicer that starts engines through `launcher`.
    pub fn new(launcher: impl EngineLauncher + 'static, config: SlicerConfig) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                launcher: Arc::new(launcher),
                config,
                init_lock: AsyncMutex::new(()),
                run_lock: AsyncMutex::new(()),
                current: Mutex::new(None),
                status_tx,
            }),
        }
    }

    /// Create a slicer that runs `bundle` on worker threads, stubbing the
    /// configured URL patterns during bootstrap.
    pub fn from_bundle<F>(bundle: F, config: SlicerConfig) -> Self
    where
        F: Fn() -> EngineBundle + Send + Sync + 'static,
    {
        let stubs = config.stub_patterns.clone();
        let launcher = WorkerLauncher::new(move || bundle().stub_all(stubs.iter().cloned()));
        Self::new(launcher, config)
    }

    /// Active configuration.
    pub fn config(&self) -> &SlicerConfig {
        &self.inner.config
    }

    /// Subscribe to phase transitions and engine progress.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SliceStatus> {
        self.inner.status_tx.subscribe()
    }

    fn current(&self) -> Option<Arc<EngineSession>> {
        lock(&self.inner.current)
            .as_ref()
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.current()
            .map(|session| session.phase())
            .unwrap_or(Phase::Uninitialized)
    }

    /// Whether an engine session is up and handshaken.
    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    /// Error from the most recent failed request on the current session.
    pub fn last_error(&self) -> Option<SliceError> {
        self.current().and_then(|session| session.last_error())
    }

    /// Start the engine and complete the handshake.
    ///
    /// Concurrent and repeated calls share one session; only a torn-down or
    /// crashed session is replaced.
    pub async fn initialize(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn session(&self) -> Result<Arc<EngineSession>> {
        let _init = self.inner.init_lock.lock().await;
        if let Some(session) = self.current() {
            return Ok(session);
        }
        let session = self.start_session().await?;
        *lock(&self.inner.current) = Some(session.clone());
        Ok(session)
    }

    async fn start_session(&self) -> Result<Arc<EngineSession>> {
        let handle = self.inner.launcher.launch()?;
        let (endpoint, worker) = handle.loaded().await?;
        let (outbound, inbound) = endpoint.split();

        let correlator = Arc::new(Correlator::new(outbound));
        let (ready_tx, ready_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch(
            inbound,
            correlator.clone(),
            self.inner.status_tx.clone(),
            Some(ready_tx),
        ));

        let session = Arc::new(EngineSession {
            correlator,
            status_tx: self.inner.status_tx.clone(),
            phase: Mutex::new(Phase::Uninitialized),
            last_error: Mutex::new(None),
            configured: Mutex::new(None),
            dispatcher: Mutex::new(Some(dispatcher)),
            worker,
        });

        session
            .correlator
            .notify(EngineCall::Init, json!({}))
            .map_err(|_| SliceError::Handshake("engine closed before init".into()))?;

        let init_timeout = self.inner.config.init_timeout();
        match tokio::time::timeout(init_timeout, ready_rx).await {
            Ok(Ok(info)) => tracing::info!(%info, "engine ready"),
            Ok(Err(_)) => {
                session.close();
                return Err(SliceError::Handshake(
                    "engine closed before init_done".into(),
                ));
            }
            Err(_) => {
                session.close();
                return Err(SliceError::Handshake(format!(
                    "no init_done within {} ms",
                    init_timeout.as_millis()
                )));
            }
        }

        session.set_phase(Phase::Ready);
        Ok(session)
    }

    async fn permit(&self) -> Result<AsyncMutexGuard<'_, ()>> {
        match self.inner.config.busy_policy {
            BusyPolicy::Queue => Ok(self.inner.run_lock.lock().await),
            BusyPolicy::Reject => self
                .inner
                .run_lock
                .try_lock()
                .map_err(|_| SliceError::EngineBusy),
        }
    }

    /// Send both profiles to the engine and wait for both acknowledgements.
    pub async fn configure(&self, device: DeviceProfile, process: ProcessProfile) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.session().await?;
        session.configure(device, process).await
    }

    /// Parse, slice, prepare and export `model` with the configured profiles.
    pub async fn slice_file(&self, model: Vec<u8>) -> Result<SliceResult> {
        let _permit = self.permit().await?;
        let session = self.session().await?;
        session.run_phases(model).await
    }

    /// Configure and slice as one queued unit.
    pub async fn slice(&self, request: SliceRequest) -> Result<SliceResult> {
        let _permit = self.permit().await?;
        self.run_request(request).await
    }

    /// Body of a composite request; the caller holds the run permit.
    async fn run_request(&self, request: SliceRequest) -> Result<SliceResult> {
        let session = self.session().await?;
        let SliceRequest {
            model,
            device,
            process,
        } = request;
        session.configure(device, process).await?;
        session.run_phases(model).await
    }

    /// [`slice`](Self::slice) with a caller-side deadline.
    ///
    /// The deadline covers time spent queued. Expiring in the queue only
    /// returns [`SliceError::Timeout`]; expiring after the request reached
    /// the engine tears the session down so any late reply is discarded.
    pub async fn slice_with_timeout(
        &self,
        request: SliceRequest,
        timeout: Duration,
    ) -> Result<SliceResult> {
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = tokio::time::Instant::now() + timeout;

        let _permit = match tokio::time::timeout_at(deadline, self.permit()).await {
            Ok(permit) => permit?,
            Err(_) => {
                tracing::warn!(timeout_ms, "slice timed out while queued");
                return Err(SliceError::Timeout(timeout_ms));
            }
        };

        match tokio::time::timeout_at(deadline, self.run_request(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms, "slice timed out");
                self.teardown().await;
                Err(SliceError::Timeout(timeout_ms))
            }
        }
    }

    /// Abandon in-flight calls and stop the engine. The next request starts a new one.
    pub async fn teardown(&self) {
        let _init = self.inner.init_lock.lock().await;
        let taken = lock(&self.inner.current).take();
        if let Some(session) = taken {
            session.close();
            let _ = self.inner.status_tx.send(SliceStatus::Phase {
                phase: Phase::Uninitialized,
            });
        }
    }
}
