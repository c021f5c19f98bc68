//! Cluster-visible reporting of update transitions.
//!
//! The daemon announces what it does to a node as Kubernetes Events on
//! that node, which is the first place an operator looks (`kubectl
//! describe node`). Every event this daemon emits concerns the one node
//! it manages, so the publisher is bound to that node at construction
//! and call sites only say what happened.
//!
//! An event that cannot be written is worth a log line, never a failed
//! sync: publishing swallows errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Records update lifecycle events against the managed node.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record one event. `reason` comes from [`reasons`]; `action` names
    /// the daemon activity (e.g. `Update`, `Sync`); `note` is the
    /// human-readable detail line.
    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: Option<String>);
}

/// Publisher backed by the cluster's Event API.
///
/// Identifies itself per node: the reporting component is shared by the
/// whole fleet, while `Reporter.instance` carries the node name so
/// events from many daemons stay distinguishable in `kubectl get events`.
pub struct KubeEventPublisher {
    recorder: Recorder,
    node_ref: ObjectReference,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `component`, bound to `node`.
    pub fn new(client: Client, component: &str, node: &str) -> Self {
        Self {
            recorder: Recorder::new(client, reporter(component, node)),
            node_ref: node_reference(node),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: Option<String>) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.node_ref).await {
            warn!(reason, error = %e, "could not record event on node");
        }
    }
}

/// Publisher for tests and cluster-less once-from runs: drops everything.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _type: EventType, _reason: &str, _action: &str, _note: Option<String>) {}
}

/// Identity the daemon reports events under: one shared component name,
/// instance-scoped to the node.
fn reporter(component: &str, node: &str) -> Reporter {
    Reporter {
        controller: component.to_string(),
        instance: Some(node.to_string()),
    }
}

/// The ObjectReference events attach to: the managed node itself.
pub fn node_reference(name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// The node was cordoned and an update began
    pub const UPDATE_STARTED: &str = "UpdateStarted";
    /// A post-reboot validation confirmed the update
    pub const UPDATE_COMPLETE: &str = "UpdateComplete";
    /// The agent gave up; the node needs external intervention
    pub const DEGRADED: &str = "Degraded";
    /// A first-boot OS pivot was staged
    pub const BOOTSTRAP_PIVOT: &str = "BootstrapPivot";
}
