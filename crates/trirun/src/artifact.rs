//! # Artifact Cache
//!
//! Compiles the sandbox bytecode into a reusable component exactly once.
//! Compilation is the expensive step (tens of milliseconds); deriving a live
//! instance from the cached artifact is cheap, so the cache is created at pool
//! initialization and only touched again on an explicit reload.
//!
//! The cache owns the wasmtime Engine. The current artifact is swapped behind
//! a read-write lock: in-flight instantiations that already captured the old
//! `Arc<Artifact>` are not retroactively affected by a recompile.
//!
//! The engine runs with epoch interruption enabled and the cache drives the
//! epoch from a ticker thread. Stores are configured to yield to the async
//! executor on each tick, so a compute-bound guest that never calls a host
//! import still reaches an await point and the dispatcher's invocation
//! deadline can fire.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use wasmtime::Engine;
use wasmtime::component::Component;

#[derive(Debug)]
pub enum Error {
    Engine(wasmtime::Error),
    Compile(wasmtime::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "Engine error: {}", e),
            Self::Compile(e) => write!(f, "Compilation error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// An immutable, validated, loadable representation of the sandboxed program.
///
/// Shared read-only by every instance derived from it. A recompile installs a
/// new Artifact with a bumped generation; it never mutates an existing one.
pub struct Artifact {
    component: Component,
    generation: u64,
    compiled_in: Duration,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("generation", &self.generation)
            .field("compiled_in", &self.compiled_in)
            .finish_non_exhaustive()
    }
}

impl Artifact {
    pub fn component(&self) -> &Component {
        &self.component
    }

    /// Monotonic counter bumped on every recompile.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wall time the compile step took.
    pub fn compiled_in(&self) -> Duration {
        self.compiled_in
    }
}

/// Interval at which the cache advances the engine epoch. Bounds how long a
/// busy-looping guest can hold a worker before yielding.
const EPOCH_TICK: Duration = Duration::from_millis(5);

/// Owns the Engine and the current compiled artifact.
pub struct ArtifactCache {
    engine: Engine,
    bytecode: Vec<u8>,
    current: RwLock<Arc<Artifact>>,
    next_generation: AtomicU64,
    ticker_stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("next_generation", &self.next_generation)
            .finish_non_exhaustive()
    }
}

impl ArtifactCache {
    /// Compiles `bytecode` into a component and caches it.
    ///
    /// Fails with `Error::Compile` if the bytecode is structurally invalid at
    /// the loader level. This is not a content judgment: a program that loads
    /// but misbehaves compiles fine here.
    pub fn compile(bytecode: impl Into<Vec<u8>>) -> Result<Self> {
        let mut config = wasmtime::Config::new();
        config.async_support(true);
        config.wasm_component_model(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(Error::Engine)?;

        let bytecode = bytecode.into();
        let artifact = Self::compile_with(&engine, &bytecode, 1)?;
        tracing::info!(
            compile_ms = artifact.compiled_in.as_secs_f64() * 1000.0,
            "artifact compiled"
        );

        let ticker_stop = Arc::new(AtomicBool::new(false));
        {
            let engine = engine.clone();
            let stop = ticker_stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            });
        }

        Ok(Self {
            engine,
            bytecode,
            current: RwLock::new(Arc::new(artifact)),
            next_generation: AtomicU64::new(2),
            ticker_stop,
        })
    }

    fn compile_with(engine: &Engine, bytecode: &[u8], generation: u64) -> Result<Artifact> {
        let started = Instant::now();
        let component = Component::new(engine, bytecode).map_err(Error::Compile)?;
        Ok(Artifact {
            component,
            generation,
            compiled_in: started.elapsed(),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Snapshot of the current artifact.
    pub fn current(&self) -> Arc<Artifact> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Recompiles the retained bytecode and swaps the shared artifact.
    ///
    /// Safe to call on a healthy pool; only instances created after the swap
    /// observe the new artifact.
    pub fn recompile(&self) -> Result<Arc<Artifact>> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let artifact = Arc::new(Self::compile_with(&self.engine, &self.bytecode, generation)?);
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = artifact.clone();
        tracing::info!(generation, "artifact recompiled");
        Ok(artifact)
    }

    /// Compile duration of the current artifact.
    pub fn compile_time(&self) -> Duration {
        self.current().compiled_in
    }
}

impl Drop for ArtifactCache {
    fn drop(&mut self) {
        self.ticker_stop.store(true, Ordering::Relaxed);
    }
}
