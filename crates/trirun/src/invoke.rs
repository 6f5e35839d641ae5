//! # Execution Seams
//!
//! The contracts between the pool state machine and whatever actually runs
//! the sandboxed program. The Wasm backing in [`crate::instance`] is one
//! implementation; tests drive the pool with scripted implementations.

use std::sync::Arc;
use std::time::Duration;

use crate::sink::Publication;

/// The per-instance result of processing one frame.
///
/// A trap is captured here and never escapes to the caller of the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The ordered publications the instance produced for this frame.
    Value(Vec<Publication>),
    /// The instance trapped, with a human-readable cause.
    Trap(String),
}

impl Outcome {
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap(_))
    }
}

/// Counters exported by the sandboxed program itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuestStats {
    pub frames_processed: u64,
    pub frames_invalid: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum BuildError {
    /// The template itself failed to compile. Fatal, never retried.
    Compile(String),
    /// Instantiation failed, typically resource exhaustion. Retried by the
    /// recovery manager with backoff.
    Instantiate(String),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compile(msg) => write!(f, "Compilation error: {}", msg),
            Self::Instantiate(msg) => write!(f, "Instantiation error: {}", msg),
        }
    }
}

impl std::error::Error for BuildError {}

pub type BuildResult<T> = std::result::Result<T, BuildError>;

/// One live, isolated execution context.
///
/// Implementations must serialize their own invocations: concurrent frames
/// hitting the same slot queue behind each other, while different slots stay
/// independent. A trap must leave no reusable partial state behind: the pool
/// discards the whole invoker on fault, never resumes it.
#[async_trait::async_trait]
pub trait Invoker: Send + Sync + 'static {
    /// Executes one processing cycle against `frame`.
    ///
    /// Never returns an error: a fault inside the sandbox is converted into
    /// `Outcome::Trap`.
    async fn invoke(&self, frame: &[u8]) -> Outcome;

    /// Polls the guest's own exported counters, if it exports any.
    async fn stats(&self) -> Option<GuestStats> {
        None
    }
}

/// Derives fresh invokers from the cached template.
#[async_trait::async_trait]
pub trait InstanceFactory: Send + Sync + 'static {
    /// Creates one fresh instance. Cheap relative to `refresh`.
    async fn build(&self) -> BuildResult<Arc<dyn Invoker>>;

    /// Recompiles or otherwise refreshes the shared template. Only called on
    /// an explicit reload, never per frame.
    async fn refresh(&self) -> BuildResult<()>;

    /// Compile duration of the current template, when known.
    fn compile_time(&self) -> Option<Duration> {
        None
    }
}
