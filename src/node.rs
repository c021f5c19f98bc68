//! Node annotation surface and cluster-write collaborators.
//!
//! The agent owns the `currentConfig` and `state` annotations on its node;
//! an external controller owns `desiredConfig`. All writes go through
//! [`NodeWriter`] so they can be retried and mocked uniformly. Annotation
//! patches race with the controller touching the same node object, so the
//! writer re-patches on failure with jittered backoff before giving up.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use rand::Rng;
use serde_json::json;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;

/// Name of the last-confirmed-applied MachineConfig
pub const CURRENT_CONFIG_ANNOTATION: &str = "machined.dev/currentConfig";
/// Name of the MachineConfig the node should converge to
pub const DESIRED_CONFIG_ANNOTATION: &str = "machined.dev/desiredConfig";
/// Agent state: Working, Done, or Degraded
pub const STATE_ANNOTATION: &str = "machined.dev/state";
/// Set when a login session is observed on the node
pub const SSH_ACCESSED_ANNOTATION: &str = "machined.dev/sshAccessed";

/// Agent state recorded on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// An update is in flight
    Working,
    /// At rest in the desired config
    Done,
    /// The agent gave up; external intervention required
    Degraded,
}

impl AgentState {
    /// Annotation value for this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Working => "Working",
            Self::Done => "Done",
            Self::Degraded => "Degraded",
        }
    }

    /// Parse the state annotation. A missing or unrecognized value maps to
    /// `Done` for compatibility with nodes provisioned before the state
    /// annotation existed.
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            Some("Working") => Self::Working,
            Some("Degraded") => Self::Degraded,
            _ => Self::Done,
        }
    }
}

/// Read a required annotation off a node.
pub fn node_annotation<'a>(node: &'a Node, key: &str) -> Result<&'a str, Error> {
    node_annotation_opt(node, key).ok_or_else(|| {
        Error::node(format!(
            "node {} missing annotation {key}",
            node.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })
}

/// Read an optional annotation off a node.
pub fn node_annotation_opt<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

/// Persists agent-owned annotations on the node, with write retry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeWriter: Send + Sync {
    /// Mark an update as in flight.
    async fn set_working(&self, node: &str) -> Result<(), Error>;

    /// Record `new_current` as applied and return the node to rest.
    async fn set_done(&self, node: &str, new_current: &str) -> Result<(), Error>;

    /// Mark the node degraded with a human-readable reason.
    async fn set_degraded(&self, node: &str, reason: &str) -> Result<(), Error>;

    /// Record that a login session was observed.
    async fn set_ssh_accessed(&self, node: &str) -> Result<(), Error>;
}

/// Retry policy for node annotation patches.
#[derive(Clone, Debug)]
struct WriteRetry {
    /// Patch attempts before the write is given up
    attempts: u32,
    /// Backoff before the first re-patch; doubles per attempt
    base_delay: Duration,
    /// Ceiling on the doubling backoff
    max_delay: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Re-issue a node write until it sticks or the attempt limit is hit.
///
/// Conflicts resolve on re-patch because annotation merges don't depend
/// on the node's resourceVersion, so every failure is worth retrying.
/// The delay is jittered (0.5x to 1.5x) to keep the daemon from
/// re-colliding with the controller that just beat it to the write.
async fn retry_node_write<F, Fut, T>(
    policy: &WriteRetry,
    what: &str,
    mut write: F,
) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match write().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.attempts {
            error!(write = %what, attempts = attempt, error = %err, "giving up on node write");
            return Err(err);
        }

        let backoff = delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5));
        warn!(
            write = %what,
            attempt,
            error = %err,
            backoff_ms = backoff.as_millis(),
            "node write failed, backing off"
        );
        tokio::time::sleep(backoff).await;
        delay = (delay * 2).min(policy.max_delay);
    }
}

/// Production writer patching annotations through the cluster API.
pub struct KubeNodeWriter {
    client: Client,
    retry: WriteRetry,
}

impl KubeNodeWriter {
    /// Create a writer with the default write-retry policy.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: WriteRetry::default(),
        }
    }

    async fn patch_annotations(
        &self,
        node: &str,
        annotations: serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({"metadata": {"annotations": annotations}});
        retry_node_write(&self.retry, "node annotations", || {
            let api = api.clone();
            let patch = patch.clone();
            let node = node.to_string();
            async move {
                api.patch(&node, &PatchParams::default(), &Patch::Merge(patch))
                    .await
            }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl NodeWriter for KubeNodeWriter {
    async fn set_working(&self, node: &str) -> Result<(), Error> {
        self.patch_annotations(node, json!({STATE_ANNOTATION: AgentState::Working.as_str()}))
            .await
    }

    async fn set_done(&self, node: &str, new_current: &str) -> Result<(), Error> {
        self.patch_annotations(
            node,
            json!({
                CURRENT_CONFIG_ANNOTATION: new_current,
                STATE_ANNOTATION: AgentState::Done.as_str(),
            }),
        )
        .await
    }

    async fn set_degraded(&self, node: &str, reason: &str) -> Result<(), Error> {
        warn!(node, reason, "marking node degraded");
        self.patch_annotations(node, json!({STATE_ANNOTATION: AgentState::Degraded.as_str()}))
            .await
    }

    async fn set_ssh_accessed(&self, node: &str) -> Result<(), Error> {
        self.patch_annotations(node, json!({SSH_ACCESSED_ANNOTATION: "accessed"}))
            .await
    }
}

/// Cordons the node and evicts workloads ahead of a host mutation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Drainer: Send + Sync {
    /// Cordon `node` and evict its evictable pods.
    async fn drain(&self, node: &str) -> Result<(), Error>;

    /// Mark `node` schedulable again.
    async fn uncordon(&self, node: &str) -> Result<(), Error>;
}

/// Production drain helper using the eviction subresource.
pub struct KubeDrainer {
    client: Client,
}

impl KubeDrainer {
    /// Create a drain helper for the given client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            node,
            &PatchParams::default(),
            &Patch::Merge(json!({"spec": {"unschedulable": unschedulable}})),
        )
        .await?;
        Ok(())
    }

    /// Mirror pods and daemonset pods stay put during a drain.
    fn is_evictable(pod: &Pod) -> bool {
        let mirror = pod
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"));
        let daemonset = pod
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
        !mirror && !daemonset
    }
}

#[async_trait]
impl Drainer for KubeDrainer {
    async fn drain(&self, node: &str) -> Result<(), Error> {
        info!(node, "cordoning and draining");
        self.set_unschedulable(node, true).await?;

        let pods: Api<Pod> = Api::all(self.client.clone());
        let on_node = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node}")))
            .await?;

        let mut evicted = 0usize;
        for pod in on_node.items.iter().filter(|p| Self::is_evictable(p)) {
            let (Some(name), Some(namespace)) =
                (pod.metadata.name.as_deref(), pod.metadata.namespace.as_deref())
            else {
                continue;
            };
            let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            api.evict(name, &EvictParams::default()).await?;
            evicted += 1;
        }
        info!(node, evicted, "drain complete");
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), Error> {
        info!(node, "uncordoning");
        self.set_unschedulable(node, false).await
    }
}

/// Writer for once-from runs with no cluster: logs and succeeds.
pub struct OfflineNodeWriter;

#[async_trait]
impl NodeWriter for OfflineNodeWriter {
    async fn set_working(&self, node: &str) -> Result<(), Error> {
        debug!(node, "offline: skipping working annotation");
        Ok(())
    }

    async fn set_done(&self, node: &str, new_current: &str) -> Result<(), Error> {
        debug!(node, new_current, "offline: skipping done annotation");
        Ok(())
    }

    async fn set_degraded(&self, node: &str, reason: &str) -> Result<(), Error> {
        warn!(node, reason, "offline: node would be marked degraded");
        Ok(())
    }

    async fn set_ssh_accessed(&self, node: &str) -> Result<(), Error> {
        debug!(node, "offline: skipping ssh-accessed annotation");
        Ok(())
    }
}

/// Drain helper for once-from runs with no cluster: logs and succeeds.
pub struct OfflineDrainer;

#[async_trait]
impl Drainer for OfflineDrainer {
    async fn drain(&self, node: &str) -> Result<(), Error> {
        debug!(node, "offline: skipping drain");
        Ok(())
    }

    async fn uncordon(&self, node: &str) -> Result<(), Error> {
        debug!(node, "offline: skipping uncordon");
        Ok(())
    }
}
