//! Approval checkpoint for side-effecting tools.
//!
//! The gate owns a single pending-request slot. A front end subscribes to
//! [`PermissionGate::subscribe`], shows the request to the operator, and answers
//! through [`PermissionGate::resolve`]. While a request is pending, the turn that
//! raised it is suspended; further requests queue behind it.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};

/// Tools that need approval unless configured otherwise.
pub const DEFAULT_DANGEROUS_TOOLS: &[&str] =
    &["write_file", "run_command", "stop_process", "send_input"];

/// Operator answer to a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    ApproveOnce,
    Deny,
    /// Approve and stop asking about this tool for the rest of the process
    ApproveForSession,
}

/// Outcome of [`PermissionGate::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

/// What the operator is asked to approve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

struct Pending {
    request: PermissionRequest,
    responder: oneshot::Sender<PermissionDecision>,
}

pub struct PermissionGate {
    dangerous: HashSet<String>,
    session_allow: Mutex<HashSet<String>>,
    pending: Mutex<Option<Pending>>,
    /// Held for the lifetime of one outstanding request
    outstanding: tokio::sync::Mutex<()>,
    requests: broadcast::Sender<PermissionRequest>,
}

impl PermissionGate {
    pub fn new<I, S>(dangerous: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (requests, _) = broadcast::channel(8);
        Self {
            dangerous: dangerous.into_iter().map(Into::into).collect(),
            session_allow: Mutex::new(HashSet::new()),
            pending: Mutex::new(None),
            outstanding: tokio::sync::Mutex::new(()),
            requests,
        }
    }

    /// Gate guarding [`DEFAULT_DANGEROUS_TOOLS`].
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DANGEROUS_TOOLS.iter().copied())
    }

    /// Gate that approves everything.
    pub fn permissive() -> Self {
        Self::new(std::iter::empty::<String>())
    }

    /// Receive requests that need an operator decision.
    pub fn subscribe(&self) -> broadcast::Receiver<PermissionRequest> {
        self.requests.subscribe()
    }

    /// Whether a call to `tool_name` would suspend for a decision right now.
    pub fn requires_approval(&self, tool_name: &str) -> bool {
        self.dangerous.contains(tool_name) && !self.session_allow.lock().contains(tool_name)
    }

    /// The request currently waiting for a decision, if any.
    pub fn pending(&self) -> Option<PermissionRequest> {
        self.pending.lock().as_ref().map(|p| p.request.clone())
    }

    /// Tool names approved for the rest of the session.
    pub fn session_approvals(&self) -> Vec<String> {
        let mut names: Vec<String> = self.session_allow.lock().iter().cloned().collect();
        names.sort();
        names
    }

    /// Decide whether a call may run, suspending until the operator answers if needed.
    ///
    /// With no subscribed front end the request cannot be answered and is denied.
    pub async fn check(&self, tool_name: &str, arguments: &serde_json::Value) -> Permission {
        if !self.requires_approval(tool_name) {
            return Permission::Granted;
        }

        let _outstanding = self.outstanding.lock().await;
        // The request we queued behind may have approved this tool for the session
        if !self.requires_approval(tool_name) {
            return Permission::Granted;
        }

        let request = PermissionRequest {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
        };
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(Pending {
            request: request.clone(),
            responder: tx,
        });

        if self.requests.send(request).is_err() {
            self.pending.lock().take();
            tracing::warn!(tool = tool_name, "No front end to approve tool call, denying");
            return Permission::Denied;
        }

        let decision = rx.await.unwrap_or(PermissionDecision::Deny);
        tracing::debug!(tool = tool_name, ?decision, "Permission resolved");

        match decision {
            PermissionDecision::ApproveOnce => Permission::Granted,
            PermissionDecision::ApproveForSession => {
                self.session_allow.lock().insert(tool_name.to_string());
                Permission::Granted
            }
            PermissionDecision::Deny => Permission::Denied,
        }
    }

    /// Answer the pending request. Returns `false` when nothing was waiting.
    pub fn resolve(&self, decision: PermissionDecision) -> bool {
        match self.pending.lock().take() {
            Some(pending) => pending.responder.send(decision).is_ok(),
            None => false,
        }
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn args() -> serde_json::Value {
        serde_json::json!({"path": "a.txt", "content": "x"})
    }

    /// Spawn a front end that answers every request with `decision`.
    fn answer_all(gate: &Arc<PermissionGate>, decision: PermissionDecision) {
        let mut rx = gate.subscribe();
        let gate = gate.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_ok() {
                gate.resolve(decision);
            }
        });
    }

    #[tokio::test]
    async fn test_safe_tool_granted_without_front_end() {
        let gate = PermissionGate::with_defaults();
        assert_eq!(gate.check("read_file", &args()).await, Permission::Granted);
    }

    #[tokio::test]
    async fn test_dangerous_tool_denied_without_front_end() {
        let gate = PermissionGate::with_defaults();
        assert_eq!(gate.check("write_file", &args()).await, Permission::Denied);
        assert!(gate.pending().is_none());
    }

    #[tokio::test]
    async fn test_approve_once_does_not_remember() {
        let gate = Arc::new(PermissionGate::with_defaults());
        answer_all(&gate, PermissionDecision::ApproveOnce);

        assert_eq!(gate.check("write_file", &args()).await, Permission::Granted);
        assert!(gate.requires_approval("write_file"));
        assert!(gate.session_approvals().is_empty());
    }

    #[tokio::test]
    async fn test_deny() {
        let gate = Arc::new(PermissionGate::with_defaults());
        answer_all(&gate, PermissionDecision::Deny);
        assert_eq!(gate.check("run_command", &args()).await, Permission::Denied);
    }

    #[tokio::test]
    async fn test_session_approval_skips_later_prompts() {
        let gate = Arc::new(PermissionGate::with_defaults());
        let mut rx = gate.subscribe();
        let responder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let req = rx.recv().await.unwrap();
                assert_eq!(req.tool_name, "run_command");
                assert_eq!(gate.pending().unwrap().tool_name, "run_command");
                assert!(gate.resolve(PermissionDecision::ApproveForSession));
            })
        };

        assert_eq!(gate.check("run_command", &args()).await, Permission::Granted);
        responder.await.unwrap();

        // No front end is listening any more: this must not suspend
        let second = tokio::time::timeout(Duration::from_millis(100), gate.check("run_command", &args()))
            .await
            .expect("session-approved check suspended");
        assert_eq!(second, Permission::Granted);
        assert_eq!(gate.session_approvals(), vec!["run_command".to_string()]);
        // Other dangerous tools still ask
        assert!(gate.requires_approval("write_file"));
    }

    #[tokio::test]
    async fn test_one_outstanding_request_at_a_time() {
        let gate = Arc::new(PermissionGate::with_defaults());
        let mut rx = gate.subscribe();

        let a = tokio::spawn({
            let gate = gate.clone();
            async move { gate.check("write_file", &args()).await }
        });
        let b = tokio::spawn({
            let gate = gate.clone();
            async move { gate.check("stop_process", &args()).await }
        });

        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(gate.resolve(PermissionDecision::ApproveOnce));

        rx.recv().await.unwrap();
        assert!(gate.resolve(PermissionDecision::Deny));

        let mut results = vec![a.await.unwrap(), b.await.unwrap()];
        results.sort_by_key(|p| *p == Permission::Denied);
        assert_eq!(results, vec![Permission::Granted, Permission::Denied]);
    }

    #[test]
    fn test_resolve_without_pending() {
        let gate = PermissionGate::with_defaults();
        assert!(!gate.resolve(PermissionDecision::ApproveOnce));
    }

    #[tokio::test]
    async fn test_permissive_gate() {
        let gate = PermissionGate::permissive();
        assert_eq!(gate.check("run_command", &args()).await, Permission::Granted);
    }
}
