//! Isolated execution host for the slicing engine.
//!
//! The engine runs on its own OS thread and only talks to the orchestrator
//! through the transport. Engine code is delivered as an [`EngineBundle`] of
//! [`EngineModule`]s which are installed into a fresh [`IsolatedContext`]
//! on that thread.
//!
//! Engine bootstrap code tends to pull remote assets it never needs at slice
//! time. Two things keep that from reaching the network:
//!
//! - imports a module declares up front are stripped before install when they
//!   match one of the bundle's stub patterns;
//! - while modules install, the context's fetcher is intercepted and answers
//!   matching URLs with an empty body. The interception is removed when the
//!   bootstrap window closes, on every exit path.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::error::{Result, SliceError};
use crate::protocol::{EngineCall, EngineNotice, Envelope, Reply};
use crate::transport::{self, Endpoint, TransportSender};

/// Name given to engine worker threads.
pub const WORKER_THREAD_NAME: &str = "slicebay-engine";

/// Ambient network primitive available inside the engine context.
pub trait Fetcher: Send {
    /// Fetch a resource by URL.
    fn fetch(&mut self, url: &str) -> std::result::Result<Vec<u8>, String>;
}

/// Refuses every request. The default for engine contexts.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

impl Fetcher for OfflineFetcher {
    fn fetch(&mut self, url: &str) -> std::result::Result<Vec<u8>, String> {
        Err(format!("network access disabled in engine context: {url}"))
    }
}

/// Serves resources bundled ahead of time; anything else is refused.
#[derive(Debug, Default, Clone)]
pub struct BundledFetcher {
    assets: HashMap<String, Vec<u8>>,
}

impl BundledFetcher {
    /// Create an empty asset table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset under a URL.
    pub fn with_asset(mut self, url: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(url.into(), bytes.into());
        self
    }
}

impl Fetcher for BundledFetcher {
    fn fetch(&mut self, url: &str) -> std::result::Result<Vec<u8>, String> {
        self.assets
            .get(url)
            .cloned()
            .ok_or_else(|| format!("asset not bundled: {url}"))
    }
}

/// Arguments to an exported engine function.
pub struct Request<'a> {
    /// JSON payload.
    pub data: Value,
    /// Binary buffers moved with the call.
    pub buffers: Vec<Vec<u8>>,
    outbox: Option<&'a TransportSender>,
}

impl<'a> Request<'a> {
    /// Build a request. Without an outbox, notices are dropped.
    pub fn new(data: Value, buffers: Vec<Vec<u8>>, outbox: Option<&'a TransportSender>) -> Self {
        Self {
            data,
            buffers,
            outbox,
        }
    }

    /// Emit an out-of-band progress notice.
    pub fn notify(&self, notice: EngineNotice) {
        if let Some(outbox) = self.outbox {
            let _ = outbox.send(notice.into_envelope());
        }
    }
}

/// An exported engine function.
pub type Handler = Box<dyn FnMut(Request<'_>) -> std::result::Result<Value, String>>;

/// Loadable unit of engine code.
pub trait EngineModule: Send {
    /// Module name, used in diagnostics.
    fn name(&self) -> &str;

    /// Remote resources the module loads while bootstrapping.
    fn imports(&self) -> Vec<String> {
        Vec::new()
    }

    /// Install the module into the context, exporting its entry points.
    fn install(&self, scope: &mut BootstrapScope<'_>) -> std::result::Result<(), String>;
}

/// Engine code plus the loading policy for it.
#[derive(Default)]
pub struct EngineBundle {
    modules: Vec<Box<dyn EngineModule>>,
    stub_patterns: Vec<String>,
}

impl EngineBundle {
    /// Empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a module; modules install in insertion order.
    pub fn with_module(mut self, module: impl EngineModule + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    /// Short-circuit URLs containing `pattern` during bootstrap.
    pub fn stub(mut self, pattern: impl Into<String>) -> Self {
        self.stub_patterns.push(pattern.into());
        self
    }

    /// Short-circuit several URL patterns.
    pub fn stub_all<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stub_patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    fn is_stubbed(&self, url: &str) -> bool {
        self.stub_patterns.iter().any(|p| url.contains(p.as_str()))
    }
}

/// Execution context owned by the engine thread.
pub struct IsolatedContext {
    fetcher: Box<dyn Fetcher>,
    intercept: Option<Vec<String>>,
    stubbed: Vec<String>,
    exports: HashMap<EngineCall, Handler>,
}

impl IsolatedContext {
    /// Fresh context with no exports.
    pub fn new(fetcher: Box<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            intercept: None,
            stubbed: Vec::new(),
            exports: HashMap::new(),
        }
    }

    /// Fetch through the context's network primitive.
    pub fn fetch(&mut self, url: &str) -> std::result::Result<Vec<u8>, String> {
        if let Some(patterns) = &self.intercept {
            if patterns.iter().any(|p| url.contains(p.as_str())) {
                tracing::debug!(url = %url, "short-circuiting fetch during bootstrap");
                self.stubbed.push(url.to_string());
                return Ok(Vec::new());
            }
        }
        self.fetcher.fetch(url)
    }

    /// Whether fetches are currently being intercepted.
    pub fn is_intercepting(&self) -> bool {
        self.intercept.is_some()
    }

    /// URLs answered by interception or stripped before install.
    pub fn stubbed_urls(&self) -> &[String] {
        &self.stubbed
    }

    /// Whether an entry point has been exported.
    pub fn exports(&self, call: EngineCall) -> bool {
        self.exports.contains_key(&call)
    }

    /// Open a bootstrap window; interception ends when the guard drops.
    fn intercept(&mut self, patterns: Vec<String>) -> InterceptGuard<'_> {
        self.intercept = Some(patterns);
        InterceptGuard { ctx: self }
    }

    /// Run an exported function.
    pub fn invoke(&mut self, call: EngineCall, request: Request<'_>) -> std::result::Result<Value, String> {
        match self.exports.get_mut(&call) {
            Some(handler) => handler(request),
            None => Err(format!("`{call}` is not exported by the engine")),
        }
    }
}

struct InterceptGuard<'a> {
    ctx: &'a mut IsolatedContext,
}

impl Deref for InterceptGuard<'_> {
    type Target = IsolatedContext;

    fn deref(&self) -> &IsolatedContext {
        self.ctx
    }
}

impl DerefMut for InterceptGuard<'_> {
    fn deref_mut(&mut self) -> &mut IsolatedContext {
        self.ctx
    }
}

impl Drop for InterceptGuard<'_> {
    fn drop(&mut self) {
        self.ctx.intercept = None;
    }
}

/// Handle given to [`EngineModule::install`].
pub struct BootstrapScope<'a> {
    ctx: &'a mut IsolatedContext,
}

impl BootstrapScope<'_> {
    /// Fetch a resource; stubbed URLs return an empty body.
    pub fn fetch(&mut self, url: &str) -> std::result::Result<Vec<u8>, String> {
        self.ctx.fetch(url)
    }

    /// Export a function under a protocol entry point, replacing any earlier export.
    pub fn export<F>(&mut self, call: EngineCall, handler: F)
    where
        F: FnMut(Request<'_>) -> std::result::Result<Value, String> + 'static,
    {
        self.ctx.exports.insert(call, Box::new(handler));
    }
}

fn bootstrap_error(symbol: &str, reason: impl Into<String>) -> SliceError {
    SliceError::EngineBootstrap {
        symbol: symbol.to_string(),
        reason: reason.into(),
    }
}

/// Install every module of `bundle` into `ctx` and check the required entry points.
pub fn load_bundle(ctx: &mut IsolatedContext, bundle: &EngineBundle) -> Result<()> {
    {
        let mut window = ctx.intercept(bundle.stub_patterns.clone());
        for module in &bundle.modules {
            let name = module.name().to_string();
            for url in module.imports() {
                if bundle.is_stubbed(&url) {
                    tracing::debug!(module = %name, url = %url, "stripping remote import");
                    window.stubbed.push(url);
                    continue;
                }
                window
                    .fetch(&url)
                    .map_err(|reason| bootstrap_error(&name, reason))?;
            }

            let mut scope = BootstrapScope { ctx: &mut *window };
            match catch_unwind(AssertUnwindSafe(|| module.install(&mut scope))) {
                Ok(Ok(())) => tracing::debug!(module = %name, "module installed"),
                Ok(Err(reason)) => return Err(bootstrap_error(&name, reason)),
                Err(_) => return Err(bootstrap_error(&name, "panicked during install")),
            }
        }
    }

    for call in EngineCall::REQUIRED {
        if !ctx.exports(call) {
            return Err(bootstrap_error(call.name(), "entry point not exported"));
        }
    }
    Ok(())
}

/// Answer envelopes until the orchestrator hangs up or a handler panics.
fn serve(mut ctx: IsolatedContext, endpoint: Endpoint) {
    let (tx, mut rx) = endpoint.split();
    while let Some(envelope) = rx.blocking_recv() {
        let Envelope {
            f, seq, data, buffers,
        } = envelope;
        let reply = |reply: Reply| {
            if seq != 0 {
                let _ = tx.send(Envelope::ack(seq, reply));
            }
        };

        let call = match f.parse::<EngineCall>() {
            Ok(call) => call,
            Err(err) => {
                tracing::warn!(function = %f, "engine received unknown call");
                reply(Reply::Err(err.to_string()));
                continue;
            }
        };

        match call {
            EngineCall::Init => {
                let _ = tx.send(Envelope::notify(
                    EngineCall::InitDone,
                    json!({ "exports": ctx.exports.len() }),
                ));
            }
            EngineCall::InitDone | EngineCall::Ack | EngineCall::Status => {
                tracing::warn!(function = %f, "engine ignoring reply-only message");
            }
            _ => {
                let request = Request::new(data, buffers, Some(&tx));
                match catch_unwind(AssertUnwindSafe(|| ctx.invoke(call, request))) {
                    Ok(Ok(value)) => reply(Reply::Ok(value)),
                    Ok(Err(message)) => reply(Reply::Err(message)),
                    Err(_) => {
                        tracing::error!(call = %call, "engine panicked; shutting worker down");
                        reply(Reply::Err(format!("engine panicked in `{call}`")));
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("engine worker exiting");
}

/// Orchestrator-side handle on a running engine.
pub struct EngineHandle {
    endpoint: Endpoint,
    loaded: oneshot::Receiver<Result<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EngineHandle {
    /// Wrap an endpoint whose engine reports its bootstrap outcome on `loaded`.
    pub fn new(endpoint: Endpoint, loaded: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            endpoint,
            loaded,
            worker: None,
        }
    }

    /// Wrap an endpoint whose engine is already loaded.
    pub fn ready(endpoint: Endpoint) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(()));
        Self::new(endpoint, rx)
    }

    /// Wait for the bootstrap outcome and hand back the transport endpoint.
    pub async fn loaded(self) -> Result<(Endpoint, Option<thread::JoinHandle<()>>)> {
        match self.loaded.await {
            Ok(Ok(())) => Ok((self.endpoint, self.worker)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(bootstrap_error("worker", "engine thread exited during bootstrap")),
        }
    }
}

/// Spawns engine worker threads.
pub struct EngineHost;

impl EngineHost {
    /// Start a worker thread, load `bundle` into a fresh context there, then serve calls.
    pub fn bootstrap(bundle: EngineBundle, fetcher: Box<dyn Fetcher>) -> Result<EngineHandle> {
        let (orchestrator, engine) = transport::channel();
        let (loaded_tx, loaded_rx) = oneshot::channel();

        let worker = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                let mut ctx = IsolatedContext::new(fetcher);
                let outcome = load_bundle(&mut ctx, &bundle);
                if !ctx.stubbed_urls().is_empty() {
                    tracing::info!(count = ctx.stubbed_urls().len(), "remote loads neutralized");
                }
                let ok = outcome.is_ok();
                if let Err(err) = &outcome {
                    tracing::error!(error = %err, "engine bootstrap failed");
                }
                let _ = loaded_tx.send(outcome);
                if ok {
                    serve(ctx, engine);
                }
            })?;

        let mut handle = EngineHandle::new(orchestrator, loaded_rx);
        handle.worker = Some(worker);
        Ok(handle)
    }
}

/// Produces engine handles for new sessions.
pub trait EngineLauncher: Send + Sync {
    /// Start a fresh engine. Called once per session.
    fn launch(&self) -> Result<EngineHandle>;
}

type BundleFactory = dyn Fn() -> EngineBundle + Send + Sync;
type FetcherFactory = dyn Fn() -> Box<dyn Fetcher> + Send + Sync;

/// Launches engines on worker threads from a bundle factory.
#[derive(Clone)]
pub struct WorkerLauncher {
    bundle: Arc<BundleFactory>,
    fetcher: Arc<FetcherFactory>,
}

impl WorkerLauncher {
    /// Launcher with an offline fetcher.
    pub fn new<F>(bundle: F) -> Self
    where
        F: Fn() -> EngineBundle + Send + Sync + 'static,
    {
        Self {
            bundle: Arc::new(bundle),
            fetcher: Arc::new(|| Box::new(OfflineFetcher)),
        }
    }

    /// Replace the ambient fetcher given to each context.
    pub fn with_fetcher<F>(mut self, fetcher: F) -> Self
    where
        F: Fn() -> Box<dyn Fetcher> + Send + Sync + 'static,
    {
        self.fetcher = Arc::new(fetcher);
        self
    }
}

impl EngineLauncher for WorkerLauncher {
    fn launch(&self) -> Result<EngineHandle> {
        EngineHost::bootstrap((self.bundle)(), (self.fetcher)())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Exports every required entry point with an echo handler.
    struct EchoModule;

    impl EngineModule for EchoModule {
        fn name(&self) -> &str {
            "echo"
        }

        fn imports(&self) -> Vec<String> {
            vec!["https://cdn.example.com/fonts/helvetiker.json".into()]
        }

        fn install(&self, scope: &mut BootstrapScope<'_>) -> std::result::Result<(), String> {
            scope.fetch("https://cdn.example.com/wasm/manifold.wasm")?;
            for call in EngineCall::REQUIRED {
                scope.export(call, move |req| Ok(json!({ "call": call.name(), "data": req.data })));
            }
            Ok(())
        }
    }

    /// Exports only part of the surface.
    struct PartialModule;

    impl EngineModule for PartialModule {
        fn name(&self) -> &str {
            "partial"
        }

        fn install(&self, scope: &mut BootstrapScope<'_>) -> std::result::Result<(), String> {
            scope.export(EngineCall::SetDevice, |_| Ok(Value::Null));
            scope.export(EngineCall::SetProcess, |_| Ok(Value::Null));
            Ok(())
        }
    }

    struct FailingModule;

    impl EngineModule for FailingModule {
        fn name(&self) -> &str {
            "failing"
        }

        fn install(&self, scope: &mut BootstrapScope<'_>) -> std::result::Result<(), String> {
            scope.fetch("https://cdn.example.com/wasm/manifold.wasm")?;
            panic!("bad module");
        }
    }

    struct CountingFetcher(Arc<AtomicUsize>);

    impl Fetcher for CountingFetcher {
        fn fetch(&mut self, _url: &str) -> std::result::Result<Vec<u8>, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(b"real".to_vec())
        }
    }

    #[test]
    fn test_load_strips_and_intercepts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut ctx = IsolatedContext::new(Box::new(CountingFetcher(hits.clone())));
        let bundle = EngineBundle::new()
            .with_module(EchoModule)
            .stub_all(["cdn.example.com"]);

        load_bundle(&mut ctx, &bundle).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.stubbed_urls().len(), 2);
        assert!(!ctx.is_intercepting());
        // Outside the window the real fetcher is back.
        assert_eq!(ctx.fetch("https://cdn.example.com/x").unwrap(), b"real".to_vec());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unstubbed_import_fails_offline() {
        let mut ctx = IsolatedContext::new(Box::new(OfflineFetcher));
        let bundle = EngineBundle::new().with_module(EchoModule);
        let err = load_bundle(&mut ctx, &bundle).unwrap_err();
        assert!(matches!(err, SliceError::EngineBootstrap { ref symbol, .. } if symbol == "echo"));
        assert!(!ctx.is_intercepting());
    }

    #[test]
    fn test_bundled_fetcher_serves_assets() {
        let fetcher = BundledFetcher::new()
            .with_asset("https://cdn.example.com/fonts/helvetiker.json", "{}")
            .with_asset("https://cdn.example.com/wasm/manifold.wasm", vec![0, 97, 115, 109]);
        let mut ctx = IsolatedContext::new(Box::new(fetcher));
        load_bundle(&mut ctx, &EngineBundle::new().with_module(EchoModule)).unwrap();
        assert!(ctx.stubbed_urls().is_empty());
    }

    #[test]
    fn test_missing_entry_point_named() {
        let mut ctx = IsolatedContext::new(Box::new(OfflineFetcher));
        let bundle = EngineBundle::new().with_module(PartialModule);
        let err = load_bundle(&mut ctx, &bundle).unwrap_err();
        assert_eq!(
            err,
            SliceError::EngineBootstrap {
                symbol: "kiri.api.parse".into(),
                reason: "entry point not exported".into(),
            }
        );
    }

    #[test]
    fn test_interception_restored_after_panic() {
        let mut ctx = IsolatedContext::new(Box::new(OfflineFetcher));
        let bundle = EngineBundle::new()
            .with_module(FailingModule)
            .stub("cdn.example.com");
        let err = load_bundle(&mut ctx, &bundle).unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert!(!ctx.is_intercepting());
        assert!(ctx.fetch("https://cdn.example.com/wasm/manifold.wasm").is_err());
    }

    #[test]
    fn test_invoke_unexported() {
        let mut ctx = IsolatedContext::new(Box::new(OfflineFetcher));
        let err = ctx
            .invoke(EngineCall::Parse, Request::new(Value::Null, vec![], None))
            .unwrap_err();
        assert!(err.contains("kiri.api.parse"));
    }

    #[tokio::test]
    async fn test_worker_round_trip() {
        let bundle = EngineBundle::new().with_module(EchoModule).stub("cdn.example.com");
        let handle = EngineHost::bootstrap(bundle, Box::new(OfflineFetcher)).unwrap();
        let (endpoint, worker) = handle.loaded().await.unwrap();
        assert!(worker.is_some());
        let (tx, mut rx) = endpoint.split();

        tx.send(Envelope::notify(EngineCall::Init, Value::Null)).unwrap();
        let hello = rx.recv().await.unwrap();
        assert_eq!(hello.f, "init_done");

        tx.send(Envelope::new(EngineCall::Slice, 7, json!("x"))).unwrap();
        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.f, "ack");
        assert_eq!(ack.seq, 7);
        let reply = Reply::from_value(ack.data).unwrap();
        assert_eq!(reply, Reply::Ok(json!({"call": "kiri.api.slice", "data": "x"})));

        tx.send(Envelope {
            f: "kiri.api.melt".into(),
            seq: 8,
            data: Value::Null,
            buffers: vec![],
        })
        .unwrap();
        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.seq, 8);
        assert!(matches!(Reply::from_value(ack.data).unwrap(), Reply::Err(_)));
    }

    #[tokio::test]
    async fn test_worker_reports_bootstrap_failure() {
        let bundle = EngineBundle::new().with_module(PartialModule);
        let handle = EngineHost::bootstrap(bundle, Box::new(OfflineFetcher)).unwrap();
        let err = handle.loaded().await.unwrap_err();
        assert!(matches!(err, SliceError::EngineBootstrap { .. }));
    }
}
