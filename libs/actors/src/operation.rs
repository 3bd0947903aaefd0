//! The process operation contract
//!
//! A [`ProcessOperation`] is the behavior behind a process id. The runtime
//! constructs one from a registered factory, feeds it the input queue one
//! message at a time, and for suspendable kinds checkpoints it through its
//! [`StateMap`] when it goes dormant.

use crate::instance::ProcessInstance;
use crate::state::StateMap;
use serde::Serialize;
use std::sync::Arc;

/// How a process relates to its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Services exactly one function call, then the runtime closes it.
    Static,
    /// Lives until closed; suspended after idle non-interaction and
    /// resumed from checkpointed state on the next delivery.
    Transient,
    /// Lives until closed; checkpointed like a transient process and
    /// expected to outlive host restarts.
    Permanent,
}

impl OperationType {
    /// Whether the dormancy sweep may suspend processes of this kind.
    pub fn is_suspendable(self) -> bool {
        matches!(self, OperationType::Transient | OperationType::Permanent)
    }
}

/// Where a process currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Active,
    Suspended,
    Closed,
}

/// Behavior hosted behind a process id.
///
/// Implementations are single-threaded by construction: the runtime
/// serializes all calls into one operation, so `&mut self` really is
/// exclusive. Most implementors will want the [`Actor`](crate::Actor)
/// convenience layer instead of this raw contract.
pub trait ProcessOperation: Send {
    /// Lifecycle kind. Fixed for the life of the process.
    fn kind(&self) -> OperationType {
        OperationType::Transient
    }

    /// Whether the operation is ready to be suspended right now. An
    /// operation holding volatile in-flight work it cannot express in
    /// its state map returns `false` to defer the dormancy sweep.
    fn is_dormant(&self) -> bool {
        true
    }

    /// Writes everything needed to reconstruct the operation into the
    /// state map. Called before the instance is evicted from memory.
    fn suspend(&mut self, state: &StateMap) {
        let _ = state;
    }

    /// Rebuilds the operation from its state map after a suspension or
    /// a host restart. Runs before any queued message is delivered.
    fn resume(&mut self, instance: &ProcessInstance) {
        let _ = instance;
    }

    /// Drains the instance's input queue. Called whenever the queue is
    /// non-empty; the operation consumes messages via the instance until
    /// it returns `None`.
    fn function(&mut self, instance: &ProcessInstance);
}

/// Constructs a fresh operation for a process. Shared between the host
/// registry and the instance so a suspended process can be rebuilt
/// on demand.
pub type OperationFactory = Arc<dyn Fn() -> Box<dyn ProcessOperation> + Send + Sync>;

/// Descriptive snapshot of one hosted process, as reported by admin
/// queries.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub account: String,
    pub app_name: String,
    pub process_class: String,
    pub kind: OperationType,
    pub state: LifecycleState,
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_static_is_never_suspendable() {
        assert!(!OperationType::Static.is_suspendable());
        assert!(OperationType::Transient.is_suspendable());
        assert!(OperationType::Permanent.is_suspendable());
    }

    #[test]
    fn test_info_serializes_snake_case() {
        let info = ProcessInfo {
            id: "00----------------------".to_string(),
            account: "acme".to_string(),
            app_name: "shop".to_string(),
            process_class: "Cart".to_string(),
            kind: OperationType::Permanent,
            state: LifecycleState::Suspended,
            created_at_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "permanent");
        assert_eq!(json["state"], "suspended");
    }
}
