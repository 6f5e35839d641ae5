//! # trirun
//!
//! A redundant execution pool for crash-prone Wasm sandbox instances.
//!
//! trirun keeps a fleet of interchangeable component instances derived from a
//! single compiled artifact, fans every input frame out to all healthy
//! instances, and reconciles their outcomes by majority agreement. An instance
//! that traps or diverges from the majority is rebuilt in the background while
//! frame processing continues on the survivors.
//!
//! ## Core Concepts
//!
//! - **ArtifactCache**: Compiles the sandbox bytecode exactly once; instances
//!   are cheaply re-derived from the cached component
//! - **Invoker / InstanceFactory**: The seams between the pool state machine
//!   and the Wasm backing; tests drive the pool with scripted implementations
//! - **InstancePool**: Fixed slots with per-slot health (`Healthy`,
//!   `Rebuilding`, `Faulted`)
//! - **Dispatcher**: The outward surface; `process_frame` fans out, votes, and
//!   forwards accepted output to the sink
//! - **RecoveryManager**: Fire-and-forget rebuild tasks with jittered backoff,
//!   never awaited on the request path
//!
//! ## Policy Regimes
//!
//! One pool parameterized by replica count:
//!
//! - `R = 1`: cold restart; a trap fails the frame and rebuilds the slot
//! - `R = 2`: hot standby; a trap flips the active slot within the same call
//! - `R >= 3`: majority voting; two-of-three (and up) agreement accepts a
//!   result and identifies the dissenting instance
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trirun::{ArtifactCache, Dispatcher, PoolConfig, WasmFactory};
//!
//! # async fn example(bytecode: Vec<u8>, frame: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(ArtifactCache::compile(bytecode)?);
//! let factory = Arc::new(WasmFactory::new(cache));
//! let pool = Dispatcher::new(factory, PoolConfig::new(3)).await?;
//!
//! let report = pool.process_frame(&frame).await?;
//! println!("{} ({})", report.accepted, report.agreement);
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod instance;
pub mod invoke;
pub(crate) mod linker;
pub mod metrics;
pub mod pool;
pub mod recover;
pub mod sink;
pub mod source;
pub mod vote;

pub use artifact::Artifact;
pub use artifact::ArtifactCache;
pub use config::PoolConfig;
pub use config::RetryPolicy;
pub use dispatch::Dispatcher;
pub use dispatch::FrameReport;
pub use dispatch::IngestSummary;
pub use instance::WasmFactory;
pub use instance::WasmInvoker;
pub use invoke::GuestStats;
pub use invoke::InstanceFactory;
pub use invoke::Invoker;
pub use invoke::Outcome;
pub use metrics::MetricsSnapshot;
pub use pool::Health;
pub use pool::InstancePool;
pub use recover::RecoveryManager;
pub use sink::ErrorCode;
pub use sink::FrameSink;
pub use sink::MemorySink;
pub use sink::NullSink;
pub use sink::Publication;
pub use sink::Qos;
pub use source::FrameSource;
pub use source::VecSource;
pub use vote::Policy;
pub use vote::Severity;
pub use vote::Vote;

#[cfg(test)]
mod tests;
