//! Resolving node annotations into the configs they name.
//!
//! Each reconcile builds a [`StateAndConfigs`] tuple from the node's
//! annotations plus the optional pending record. Configs naming the same
//! object share one `Arc`, so `Arc::ptr_eq` is the canonical "same config"
//! test used by the rest of the daemon.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{ObjectRef, Store};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::crd::MachineConfig;
use crate::error::Error;
use crate::node::{
    node_annotation, node_annotation_opt, AgentState, CURRENT_CONFIG_ANNOTATION,
    DESIRED_CONFIG_ANNOTATION, STATE_ANNOTATION,
};
use crate::{rooted, PATH_INITIAL_ANNOTATIONS};

/// Cached reads of cluster objects by name.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch a node by name; `None` when it does not exist.
    async fn node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Fetch a MachineConfig by name; an unknown name is an error.
    async fn machine_config(&self, name: &str) -> Result<Arc<MachineConfig>, Error>;
}

/// Production source backed by reflector stores.
pub struct CachedConfigSource {
    nodes: Store<Node>,
    configs: Store<MachineConfig>,
}

impl CachedConfigSource {
    /// Create a source over the given reflector stores.
    pub fn new(nodes: Store<Node>, configs: Store<MachineConfig>) -> Self {
        Self { nodes, configs }
    }
}

#[async_trait]
impl ConfigSource for CachedConfigSource {
    async fn node(&self, name: &str) -> Result<Option<Node>, Error> {
        Ok(self.nodes.get(&ObjectRef::new(name)).map(|n| (*n).clone()))
    }

    async fn machine_config(&self, name: &str) -> Result<Arc<MachineConfig>, Error> {
        self.configs
            .get(&ObjectRef::new(name))
            .ok_or_else(|| Error::config(format!("machine config {name} not found in cache")))
    }
}

/// The agent state annotation plus the parsed configs it references.
///
/// `pending` is set only when the daemon is coming up after a reboot that
/// attempted to apply a config.
pub struct StateAndConfigs {
    /// True when the initial-annotations sentinel file is present
    pub bootstrapping: bool,
    /// Agent state from the node annotation (missing maps to Done)
    pub state: AgentState,
    /// The config named by `currentConfig`
    pub current: Arc<MachineConfig>,
    /// The config named by the pending record, if any
    pub pending: Option<Arc<MachineConfig>>,
    /// The config named by `desiredConfig`
    pub desired: Arc<MachineConfig>,
}

/// Builds [`StateAndConfigs`] from a node and the pending record.
pub struct ConfigResolver {
    source: Arc<dyn ConfigSource>,
    root: PathBuf,
}

impl ConfigResolver {
    /// Create a resolver reading cluster state from `source` and the
    /// bootstrap sentinel under `root`.
    pub fn new(source: Arc<dyn ConfigSource>, root: impl Into<PathBuf>) -> Self {
        Self {
            source,
            root: root.into(),
        }
    }

    /// Detect bootstrap mode: presence of the sentinel file only; its
    /// contents are irrelevant here.
    pub fn detect_bootstrap(&self) -> Result<bool, Error> {
        match fs::symlink_metadata(rooted(&self.root, PATH_INITIAL_ANNOTATIONS)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::host(format!("checking bootstrap sentinel: {e}"))),
        }
    }

    /// Resolve the node's annotations and `pending_name` into shared
    /// config pointers. Missing `currentConfig` or `desiredConfig`
    /// annotations are failures; a missing state annotation maps to Done.
    pub async fn resolve(
        &self,
        node: &Node,
        pending_name: Option<&str>,
    ) -> Result<StateAndConfigs, Error> {
        let bootstrapping = self.detect_bootstrap()?;
        if bootstrapping {
            info!("in bootstrap mode");
        }

        let current_name = node_annotation(node, CURRENT_CONFIG_ANNOTATION)?;
        let desired_name = node_annotation(node, DESIRED_CONFIG_ANNOTATION)?;
        let state = AgentState::from_annotation(node_annotation_opt(node, STATE_ANNOTATION));

        let current = self.source.machine_config(current_name).await?;
        let desired = if desired_name == current_name {
            info!(config = %current_name, "current+desired config");
            Arc::clone(&current)
        } else {
            let desired = self.source.machine_config(desired_name).await?;
            info!(config = %current_name, "current config");
            info!(config = %desired_name, "desired config");
            desired
        };

        // Usually if current != desired then pending == desired, but the
        // desired config can change while the node is rebooting. Whatever
        // the combination, equal names must resolve to the same Arc.
        let pending = match pending_name {
            None => None,
            Some(name) if name == desired_name => Some(Arc::clone(&desired)),
            Some(name) if name == current_name => Some(Arc::clone(&current)),
            Some(name) => {
                let pending = self.source.machine_config(name).await?;
                info!(config = %name, "pending config");
                Some(pending)
            }
        };

        Ok(StateAndConfigs {
            bootstrapping,
            state,
            current,
            pending,
            desired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::MachineConfigSpec;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn node_with(current: &str, desired: &str, state: Option<&str>) -> Node {
        let mut annotations = BTreeMap::new();
        annotations.insert(CURRENT_CONFIG_ANNOTATION.to_string(), current.to_string());
        annotations.insert(DESIRED_CONFIG_ANNOTATION.to_string(), desired.to_string());
        if let Some(state) = state {
            annotations.insert(STATE_ANNOTATION.to_string(), state.to_string());
        }
        let mut node = Node::default();
        node.metadata.name = Some("worker-0".to_string());
        node.metadata.annotations = Some(annotations);
        node
    }

    fn config(name: &str) -> Arc<MachineConfig> {
        Arc::new(MachineConfig::new(name, MachineConfigSpec::default()))
    }

    fn resolver(source: MockConfigSource, root: &TempDir) -> ConfigResolver {
        ConfigResolver::new(Arc::new(source), root.path())
    }

    #[tokio::test]
    async fn test_shared_pointer_when_current_equals_desired() {
        let root = TempDir::new().unwrap();
        let mut source = MockConfigSource::new();
        source
            .expect_machine_config()
            .with(eq("rendered-1"))
            .times(1)
            .returning(|name| Ok(config(name)));

        let state = resolver(source, &root)
            .resolve(&node_with("rendered-1", "rendered-1", None), None)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&state.current, &state.desired));
        assert!(state.pending.is_none());
        assert!(!state.bootstrapping);
        assert_eq!(state.state, AgentState::Done);
    }

    #[tokio::test]
    async fn test_pending_shares_with_desired() {
        let root = TempDir::new().unwrap();
        let mut source = MockConfigSource::new();
        source
            .expect_machine_config()
            .times(2)
            .returning(|name| Ok(config(name)));

        let state = resolver(source, &root)
            .resolve(
                &node_with("rendered-1", "rendered-2", Some("Working")),
                Some("rendered-2"),
            )
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&state.current, &state.desired));
        assert!(Arc::ptr_eq(state.pending.as_ref().unwrap(), &state.desired));
        assert_eq!(state.state, AgentState::Working);
    }

    #[tokio::test]
    async fn test_pending_matching_current_shares_without_refetch() {
        let root = TempDir::new().unwrap();
        let mut source = MockConfigSource::new();
        // Desired moved on while the node rebooted back into the config it
        // already had; exactly one fetch per distinct name.
        source
            .expect_machine_config()
            .with(eq("rendered-1"))
            .times(1)
            .returning(|name| Ok(config(name)));
        source
            .expect_machine_config()
            .with(eq("rendered-2"))
            .times(1)
            .returning(|name| Ok(config(name)));

        let state = resolver(source, &root)
            .resolve(
                &node_with("rendered-1", "rendered-2", Some("Working")),
                Some("rendered-1"),
            )
            .await
            .unwrap();

        let pending = state.pending.unwrap();
        assert!(Arc::ptr_eq(&pending, &state.current));
        assert!(!Arc::ptr_eq(&pending, &state.desired));
    }

    #[tokio::test]
    async fn test_stale_pending_fetched_separately() {
        let root = TempDir::new().unwrap();
        let mut source = MockConfigSource::new();
        source
            .expect_machine_config()
            .times(3)
            .returning(|name| Ok(config(name)));

        let state = resolver(source, &root)
            .resolve(
                &node_with("rendered-1", "rendered-3", None),
                Some("rendered-2"),
            )
            .await
            .unwrap();

        let pending = state.pending.unwrap();
        assert!(!Arc::ptr_eq(&pending, &state.desired));
        assert!(!Arc::ptr_eq(&pending, &state.current));
    }

    #[tokio::test]
    async fn test_missing_annotation_is_error() {
        let root = TempDir::new().unwrap();
        let source = MockConfigSource::new();
        let mut node = Node::default();
        node.metadata.name = Some("worker-0".to_string());

        assert!(resolver(source, &root).resolve(&node, None).await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_sentinel_detection() {
        let root = TempDir::new().unwrap();
        let sentinel = rooted(root.path(), PATH_INITIAL_ANNOTATIONS);
        fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        fs::write(&sentinel, b"{}").unwrap();

        let mut source = MockConfigSource::new();
        source
            .expect_machine_config()
            .times(1)
            .returning(|name| Ok(config(name)));

        let state = resolver(source, &root)
            .resolve(&node_with("rendered-1", "rendered-1", None), None)
            .await
            .unwrap();
        assert!(state.bootstrapping);
    }
}
