use streamrpc_transport::Metadata;

use crate::signal::AbortSignal;
use crate::timer::DeadlineTimer;

/// What a handler or middleware factory knows about the call it serves.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Method named by the call's header.
    pub method: String,
    /// Fires on timeout, explicit abort, or a forced destroy.
    pub signal: AbortSignal,
    /// The call's deadline. Handlers may call `refresh` to keep a slow call alive.
    pub timer: DeadlineTimer,
    /// Transport metadata of the underlying stream.
    pub meta: Metadata,
}

impl CallContext {
    pub fn new(method: impl Into<String>, signal: AbortSignal, timer: DeadlineTimer) -> Self {
        Self {
            method: method.into(),
            signal,
            timer,
            meta: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, meta: Metadata) -> Self {
        self.meta = meta;
        self
    }
}
