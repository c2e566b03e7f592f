use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// Why a call was asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The call's deadline elapsed.
    Timeout(Duration),
    /// The server was destroyed with `force`.
    Destroyed(String),
    /// Someone aborted the call explicitly.
    Aborted(String),
}

impl CancelReason {
    pub fn to_error(&self) -> RpcError {
        match self {
            Self::Timeout(after) => RpcError::Timeout(*after),
            Self::Destroyed(reason) => RpcError::Destroyed(reason.clone()),
            Self::Aborted(reason) => RpcError::Aborted(reason.clone()),
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "timed out after {after:?}"),
            Self::Destroyed(reason) => write!(f, "destroyed: {reason}"),
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
        }
    }
}

/// Cooperative cancellation signal for one call.
///
/// Clones share state. The first reason passed to [`abort`](Self::abort)
/// wins. A [`child`](Self::child) is aborted whenever its parent is, never
/// the other way round.
#[derive(Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    parent: Option<Arc<AbortSignal>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that follows this one but can be aborted on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::default(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Abort with `reason`. Returns `true` only for the call that actually
    /// aborted the signal.
    pub fn abort(&self, reason: CancelReason) -> bool {
        if self.token.is_cancelled() || self.reason.set(reason).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The abort reason, inherited from the parent when the parent fired.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_aborted() {
            return None;
        }
        self.reason
            .get()
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.reason()))
    }

    /// Resolves with the reason once the signal is aborted.
    pub async fn aborted(&self) -> CancelReason {
        self.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| CancelReason::Aborted("signal cancelled".to_string()))
    }

    /// A token cancelled whenever this signal aborts.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The error a call observes after this signal fired.
    pub fn error(&self) -> Option<RpcError> {
        self.reason().map(|reason| reason.to_error())
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}
