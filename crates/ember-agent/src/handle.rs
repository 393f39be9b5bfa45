//! A cloneable handle for poking the agent from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

use crate::permission::{PermissionDecision, PermissionGate};

/// A cloneable handle for poking the agent from external code.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct AgentHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) gate: Arc<PermissionGate>,
    pub(crate) is_running: Arc<AtomicBool>,
}

impl AgentHandle {
    pub(crate) fn new(gate: Arc<PermissionGate>) -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            gate,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the current turn.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Token of the current turn.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Replace the token at the start of a new turn.
    pub(crate) fn reset(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    /// Answer the pending permission request, if any.
    pub fn resolve_permission(&self, decision: PermissionDecision) -> bool {
        self.gate.resolve(decision)
    }

    /// Whether a turn is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
    }
}
