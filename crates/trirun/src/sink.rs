//! # Output Sink
//!
//! The push-based collaborator that receives accepted output. The pool
//! forwards only the publication list the vote accepted, exactly once per
//! frame; per-instance publications are captured internally for comparison
//! and never reach the sink directly.

use std::sync::Mutex;

/// MQTT-style delivery guarantee requested by the guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// One message the guest asked the host to publish.
///
/// Equality is deep and structural; this is the value the voter compares
/// across instances. Guests must therefore produce deterministic output for
/// identical frames (the host links no clock or entropy imports).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

/// Error value surfaced by collaborators, mirroring the guest ABI's
/// `error-code` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u32,
    pub message: String,
}

impl ErrorCode {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorCode {}

/// Receives accepted publications.
///
/// A sink failure is contained: the dispatcher logs and counts it but never
/// converts it into a frame failure.
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn publish(&self, publication: &Publication) -> Result<(), ErrorCode>;
}

/// Discards everything. The default sink.
#[derive(Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl FrameSink for NullSink {
    async fn publish(&self, _publication: &Publication) -> Result<(), ErrorCode> {
        Ok(())
    }
}

/// Collects publications in memory, for tests and demos.
#[derive(Default)]
pub struct MemorySink {
    published: Mutex<Vec<Publication>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Publication> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait::async_trait]
impl FrameSink for MemorySink {
    async fn publish(&self, publication: &Publication) -> Result<(), ErrorCode> {
        self.published
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(publication.clone());
        Ok(())
    }
}
