//! # Frame Source
//!
//! The pull-based collaborator that supplies raw frames. The ingest pump in
//! [`crate::dispatch`] drains a source until it reports exhaustion.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::sink::ErrorCode;

/// Supplies raw input frames.
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// Returns the next frame, or `Ok(None)` when the source is exhausted.
    async fn next_frame(&self) -> Result<Option<Vec<u8>>, ErrorCode>;
}

/// A fixed in-memory frame sequence, for tests and demos.
pub struct VecSource {
    frames: Mutex<VecDeque<Vec<u8>>>,
}

impl VecSource {
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            frames: Mutex::new(frames.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for VecSource {
    async fn next_frame(&self) -> Result<Option<Vec<u8>>, ErrorCode> {
        Ok(self
            .frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front())
    }
}
