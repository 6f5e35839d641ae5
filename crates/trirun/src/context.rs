//! Store context for running gateway instances.
//!
//! Holds the staged input frame and the captured output for the invocation
//! currently in flight on this instance. The Store is behind the invoker's
//! mutex, so one cycle's state can never bleed into a concurrent frame.

use crate::sink::Publication;

pub struct GatewayCtx {
    inbox: Option<Vec<u8>>,
    outbox: Vec<Publication>,
}

impl GatewayCtx {
    pub(crate) fn new() -> Self {
        Self {
            inbox: None,
            outbox: Vec::new(),
        }
    }

    /// Stages the frame the guest's next `receive-frame` call will observe.
    pub(crate) fn begin_cycle(&mut self, frame: Vec<u8>) {
        self.inbox = Some(frame);
        self.outbox.clear();
    }

    /// Pops the staged frame. A second call within one cycle gets `None`;
    /// the guest is one-frame-per-run.
    pub(crate) fn take_frame(&mut self) -> Option<Vec<u8>> {
        self.inbox.take()
    }

    pub(crate) fn capture(&mut self, publication: Publication) {
        self.outbox.push(publication);
    }

    /// Ends the cycle, returning the captured publications and clearing any
    /// unconsumed frame. Called on trap as well, so partial output from a
    /// trapped cycle is discarded with it.
    pub(crate) fn finish_cycle(&mut self) -> Vec<Publication> {
        self.inbox = None;
        std::mem::take(&mut self.outbox)
    }
}
