//! # Wasm-Backed Instance
//!
//! One live execution context derived from the cached artifact. Wasmtime's
//! Store is !Send + !Sync, so it sits behind `Arc<Mutex<...>>`; the mutex also
//! serializes invocations on this slot, which the concurrency model requires
//! (a component instance is not safe for concurrent reentry).
//!
//! A trap here is captured and converted into `Outcome::Trap`; it never
//! escapes as an error. The trapped instance is discarded wholesale by the
//! recovery manager, so no partial state survives into a later cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use wasmtime::Store;
use wasmtime::component::Component;
use wasmtime::component::Linker;
use wasmtime::component::Val;

use crate::artifact::ArtifactCache;
use crate::context::GatewayCtx;
use crate::invoke::BuildError;
use crate::invoke::BuildResult;
use crate::invoke::GuestStats;
use crate::invoke::InstanceFactory;
use crate::invoke::Invoker;
use crate::invoke::Outcome;
use crate::linker;

/// Handle to one live gateway instance.
pub struct WasmInvoker {
    store: Arc<Mutex<Store<GatewayCtx>>>,
    instance: wasmtime::component::Instance,
    component: Arc<Component>,
    generation: u64,
}

impl WasmInvoker {
    pub(crate) async fn instantiate(cache: &ArtifactCache) -> BuildResult<Self> {
        let artifact = cache.current();
        let component = artifact.component().clone();

        let mut wasm_linker = Linker::<GatewayCtx>::new(cache.engine());
        linker::install_gateway_imports(&mut wasm_linker, &component)
            .map_err(|e| BuildError::Instantiate(e.to_string()))?;

        let mut store = Store::new(cache.engine(), GatewayCtx::new());
        // Yield to the executor on every epoch tick so a compute-bound guest
        // cannot pin the worker past the dispatcher's invocation deadline.
        store.epoch_deadline_async_yield_and_update(1);
        let instance = wasm_linker
            .instantiate_async(&mut store, &component)
            .await
            .map_err(|e| BuildError::Instantiate(e.to_string()))?;

        Ok(Self {
            store: Arc::new(Mutex::new(store)),
            instance,
            component: Arc::new(component),
            generation: artifact.generation(),
        })
    }

    /// Generation of the artifact this instance was derived from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[async_trait::async_trait]
impl Invoker for WasmInvoker {
    async fn invoke(&self, frame: &[u8]) -> Outcome {
        let Some(run_idx) = self.component.get_export_index(None, linker::RUN) else {
            return Outcome::Trap(format!("missing '{}' export", linker::RUN));
        };

        let mut guard = self.store.lock().await;
        let store = &mut *guard;
        store.data_mut().begin_cycle(frame.to_vec());

        let Some(func) = self.instance.get_func(&mut *store, &run_idx) else {
            return Outcome::Trap(format!("'{}' export is not a function", linker::RUN));
        };

        let call = async {
            func.call_async(&mut *store, &[], &mut []).await?;
            func.post_return_async(&mut *store).await
        };
        match call.await {
            Ok(()) => Outcome::Value(store.data_mut().finish_cycle()),
            Err(trap) => {
                // Discard partial output from the trapped cycle.
                store.data_mut().finish_cycle();
                Outcome::Trap(trap.to_string())
            }
        }
    }

    async fn stats(&self) -> Option<GuestStats> {
        let iface_idx = self
            .component
            .get_export_index(None, linker::METRICS_INTERFACE)?;
        let func_idx = self
            .component
            .get_export_index(Some(&iface_idx), linker::GET_STATS)?;

        let mut guard = self.store.lock().await;
        let store = &mut *guard;
        let func = self.instance.get_func(&mut *store, &func_idx)?;

        let mut results = vec![Val::Bool(false)];
        func.call_async(&mut *store, &[], &mut results).await.ok()?;
        func.post_return_async(&mut *store).await.ok()?;
        decode_stats(&results[0])
    }
}

fn decode_stats(val: &Val) -> Option<GuestStats> {
    let Val::Record(fields) = val else {
        return None;
    };
    let mut stats = GuestStats::default();
    for (name, field) in fields {
        match (name.as_str(), field) {
            ("frames-processed", Val::U64(n)) => stats.frames_processed = *n,
            ("frames-invalid", Val::U64(n)) => stats.frames_invalid = *n,
            ("bytes-in", Val::U64(n)) => stats.bytes_in = *n,
            ("bytes-out", Val::U64(n)) => stats.bytes_out = *n,
            ("last-error", Val::Option(inner)) => {
                stats.last_error = match inner.as_deref() {
                    Some(Val::String(s)) => Some(s.clone()),
                    _ => None,
                };
            }
            _ => {}
        }
    }
    Some(stats)
}

/// Derives fresh Wasm instances from the artifact cache.
pub struct WasmFactory {
    cache: Arc<ArtifactCache>,
}

impl WasmFactory {
    pub fn new(cache: Arc<ArtifactCache>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl InstanceFactory for WasmFactory {
    async fn build(&self) -> BuildResult<Arc<dyn Invoker>> {
        let invoker = WasmInvoker::instantiate(&self.cache).await?;
        Ok(Arc::new(invoker))
    }

    async fn refresh(&self) -> BuildResult<()> {
        self.cache
            .recompile()
            .map(|_| ())
            .map_err(|e| BuildError::Compile(e.to_string()))
    }

    fn compile_time(&self) -> Option<Duration> {
        Some(self.cache.compile_time())
    }
}
