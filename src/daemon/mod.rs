//! The reconcile loop and the update state machine.
//!
//! A single worker consumes a queue keyed by node name. The first work
//! after process start is the boot-time check: finalize any pending
//! config from the previous boot, validate the on-disk state, and decide
//! whether an update is needed. Only once that succeeds do normal sync
//! ticks (fed by node watch events) run. Auxiliary tasks report failures
//! on an error channel that the run loop logs without exiting.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crd::{MachineConfig, MachineConfigSpec};
use crate::error::Error;
use crate::events::{reasons, EventPublisher};
use crate::exec::CommandRunner;
use crate::health::KubeletHealthMonitor;
use crate::journal;
use crate::node::{
    node_annotation, node_annotation_opt, Drainer, NodeWriter, CURRENT_CONFIG_ANNOTATION,
    DESIRED_CONFIG_ANNOTATION,
};
use crate::once_from::{self, ContentSource, OnceFromConfig};
use crate::osimage::{NodeUpdater, OperatingSystem};
use crate::pending::{self, PendingStateStore};
use crate::resolver::{ConfigResolver, ConfigSource};
use crate::update::{Diverged, Updater};
use crate::validate::OnDiskValidator;
use crate::{rooted, PATH_INITIAL_ANNOTATIONS};

/// Pause before syncing after a node update event, to absorb churn.
pub const UPDATE_DELAY: Duration = Duration::from_secs(5);

/// Sync failures tolerated for one key before the node degrades.
///
/// With the rate limiter below (5ms * 2^(n-1)) the successive requeue
/// delays are 5ms, 10ms, 20ms, ... 41s, 82s.
pub const MAX_RETRIES: u32 = 15;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);
const DEGRADED_REQUEUE_DELAY: Duration = Duration::from_secs(60);
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Single-consumer work queue keyed by node name.
///
/// A key already waiting is not enqueued again; dequeueing re-arms it.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<String>,
    queued: Arc<Mutex<HashSet<String>>>,
}

impl WorkQueue {
    fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                queued: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Enqueue `key` after `delay`, collapsing duplicates.
    pub fn add_after(&self, key: &str, delay: Duration) {
        {
            let mut queued = self.queued.lock().expect("queue lock poisoned");
            if !queued.insert(key.to_string()) {
                return;
            }
        }
        let tx = self.tx.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(key);
        });
    }

    fn mark_dequeued(&self, key: &str) {
        self.queued.lock().expect("queue lock poisoned").remove(key);
    }
}

/// Daemon configuration from the CLI.
pub struct DaemonConfig {
    /// Name of the node this daemon manages
    pub node_name: String,
    /// Operating system flavor
    pub os: OperatingSystem,
    /// Filesystem root (`/` in production, a temp dir in tests)
    pub root: PathBuf,
    /// Run once from this local path or URL, then exit
    pub once_from: Option<String>,
    /// Whether to poll the kubelet healthz endpoint
    pub kubelet_healthz_enabled: bool,
    /// Kubelet healthz endpoint URL
    pub kubelet_healthz_endpoint: String,
    /// Whether boot-time validation failures degrade the node
    pub degrade_on_drift: bool,
}

/// External collaborators, injected for hermetic testing.
pub struct Deps {
    /// Cached cluster reads
    pub source: Arc<dyn ConfigSource>,
    /// Node annotation writer
    pub writer: Arc<dyn NodeWriter>,
    /// Cordon/drain/uncordon helper
    pub drainer: Arc<dyn Drainer>,
    /// OS image deployment backend
    pub node_updater: Arc<dyn NodeUpdater>,
    /// Kubernetes event sink
    pub events: Arc<dyn EventPublisher>,
    /// Host subprocess runner
    pub runner: Arc<dyn CommandRunner>,
}

/// Outcome of one boot-time attempt.
#[derive(Debug)]
enum BootOutcome {
    /// The node is in (or was finalized into) its desired state
    Synced,
    /// The node object is not visible yet; try again
    NodeNotFound,
    /// An update was staged and a reboot is in flight
    Rebooting,
}

/// The per-node reconciler.
pub struct Daemon {
    cfg: DaemonConfig,
    deps: Deps,
    resolver: ConfigResolver,
    validator: OnDiskValidator,
    updater: Updater,
    pending: PendingStateStore,
    queue: WorkQueue,
    rx: Option<mpsc::UnboundedReceiver<String>>,
    /// Node cached at the start of the current sync; all paths read this
    node: Option<Arc<Node>>,
    booting: bool,
    rebooting: bool,
    retries: HashMap<String, u32>,
}

impl Daemon {
    /// Set up the daemon: read the boot ID, capture the booted OS image,
    /// and wire the update machinery over `deps`.
    pub fn new(cfg: DaemonConfig, deps: Deps) -> Result<Self, Error> {
        let booted_os_image_url = match cfg.os {
            OperatingSystem::ImageBased => {
                let (url, version) = deps.node_updater.booted_os_image_url(&cfg.root)?;
                info!(url = %url, version = %version, "booted OS image");
                url
            }
            OperatingSystem::Generic => String::new(),
        };

        let boot_id = pending::read_boot_id(&cfg.root)?;
        info!(node = %cfg.node_name, boot_id = %boot_id, "managing node");

        let pending = PendingStateStore::new(&cfg.root, boot_id);
        let resolver = ConfigResolver::new(Arc::clone(&deps.source), &cfg.root);
        let validator = OnDiskValidator::new(&cfg.root, cfg.os, booted_os_image_url.clone());
        let updater = Updater::new(
            &cfg.root,
            cfg.os,
            booted_os_image_url,
            cfg.node_name.clone(),
            pending.clone(),
            Arc::clone(&deps.node_updater),
            Arc::clone(&deps.drainer),
            Arc::clone(&deps.writer),
            Arc::clone(&deps.events),
            Arc::clone(&deps.runner),
        );
        let (queue, rx) = WorkQueue::new();

        Ok(Self {
            cfg,
            deps,
            resolver,
            validator,
            updater,
            pending,
            queue,
            rx: Some(rx),
            node: None,
            booting: true,
            rebooting: false,
            retries: HashMap::new(),
        })
    }

    /// Handle for event callbacks to enqueue node names.
    pub fn queue_handle(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Run until the stop token fires.
    ///
    /// In once-from mode this applies the one config and returns. In
    /// cluster mode it spawns the auxiliaries, gates the queue behind the
    /// boot-time check, then consumes sync ticks one at a time.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), Error> {
        if let Some(source) = self.cfg.once_from.clone() {
            return match self.run_once_from(&source).await? {
                Some(_diverged) => {
                    info!("once-from update staged; reboot initiated");
                    Ok(())
                }
                None => {
                    info!("once-from: no update required");
                    Ok(())
                }
            };
        }

        let mut rx = self
            .rx
            .take()
            .ok_or_else(|| Error::node("daemon already running"))?;
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        tokio::spawn(journal::run_login_monitor(
            self.cfg.node_name.clone(),
            Arc::clone(&self.deps.writer),
            cancel.child_token(),
            err_tx.clone(),
        ));
        if self.cfg.kubelet_healthz_enabled {
            info!("enabling kubelet healthz monitor");
            let monitor = KubeletHealthMonitor::new(self.cfg.kubelet_healthz_endpoint.clone())?;
            tokio::spawn(monitor.run(cancel.child_token(), err_tx.clone()));
        }

        // Boot gate: no normal tick runs before the boot check succeeds.
        while self.booting {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let pause = match self.bootstrap_tick().await {
                Ok(BootOutcome::Synced) => {
                    info!("boot-time sync complete");
                    self.booting = false;
                    continue;
                }
                Ok(BootOutcome::Rebooting) => {
                    info!("reboot initiated; suspending reconciliation until restart");
                    self.booting = false;
                    self.rebooting = true;
                    continue;
                }
                Ok(BootOutcome::NodeNotFound) => BOOTSTRAP_RETRY_DELAY,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal boot-time error");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "boot-time sync failed");
                    self.degrade(&e).await;
                    DEGRADED_REQUEUE_DELAY
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pause) => {}
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stop requested; shutting down");
                    return Ok(());
                }
                Some(err) = err_rx.recv() => {
                    warn!(error = %err, "got an error from an auxiliary task");
                }
                maybe_key = rx.recv(), if !self.rebooting => {
                    let Some(key) = maybe_key else { return Ok(()) };
                    self.queue.mark_dequeued(&key);
                    match self.sync_node(&key).await {
                        Ok(None) => {
                            self.retries.remove(&key);
                        }
                        Ok(Some(_diverged)) => {
                            self.retries.remove(&key);
                            self.rebooting = true;
                            info!("reboot initiated; suspending reconciliation until restart");
                        }
                        Err(e) => self.handle_err(&key, e).await,
                    }
                }
            }
        }
    }

    /// The very first sync: load the node and run the boot-time check.
    async fn bootstrap_tick(&mut self) -> Result<BootOutcome, Error> {
        let Some(node) = self.deps.source.node(&self.cfg.node_name).await? else {
            debug!(node = %self.cfg.node_name, "can't find node yet");
            return Ok(BootOutcome::NodeNotFound);
        };
        self.node = Some(Arc::new(node));
        match self.check_state_on_boot().await? {
            Some(_diverged) => Ok(BootOutcome::Rebooting),
            None => Ok(BootOutcome::Synced),
        }
    }

    /// Core entry point of the state machine, run once per process start.
    ///
    /// Determines whether the node is in its desired state, finalizes a
    /// pending config from the previous boot, and kicks off an update
    /// when current and desired diverge. `Ok(None)` means at rest;
    /// `Ok(Some(_))` means a reboot is in flight.
    pub async fn check_state_on_boot(&mut self) -> Result<Option<Diverged>, Error> {
        let node = Arc::clone(
            self.node
                .as_ref()
                .ok_or_else(|| Error::node("node not loaded"))?,
        );

        if self.cfg.os == OperatingSystem::ImageBased {
            let status = self.deps.node_updater.status()?;
            info!(status = %status.trim(), "OS deployment status");
        }

        // Fatal when the record carries the current boot ID: the reboot
        // never happened, and retrying would loop.
        let pending_name = self.pending.load_pending()?;
        let state = self.resolver.resolve(&node, pending_name.as_deref()).await?;

        journal::detect_boot_ssh_accesses(
            self.deps.runner.as_ref(),
            self.deps.writer.as_ref(),
            &self.cfg.node_name,
        )
        .await
        .map_err(|e| Error::host(format!("detecting previous SSH accesses: {e}")))?;

        if state.bootstrapping {
            let target = state.current.spec.os_image_url.clone();
            if !self.validator.check_os(&target)? {
                info!(target = %target, "bootstrap pivot required");
                // The sentinel file stays: the post-pivot boot re-enters
                // bootstrap mode, finds the OS matching, and removes it then.
                return self
                    .updater
                    .update_os_and_reboot(&state.current)
                    .await
                    .map(Some);
            }
            // From here the currentConfig's OS image URL is truth; if it
            // drifts the node goes degraded.
            info!("no bootstrap pivot required; unlinking initial node annotations");
            fs::remove_file(rooted(&self.cfg.root, PATH_INITIAL_ANNOTATIONS))
                .map_err(|e| Error::host(format!("removing initial node annotations file: {e}")))?;
        }

        // Validate on-disk state against what we expect: the pending
        // config when coming up after an update reboot, else the current.
        let expected = state.pending.as_ref().unwrap_or(&state.current);
        if !self.validator.validate(expected) {
            if self.cfg.degrade_on_drift {
                return Err(Error::drift("unexpected on-disk state"));
            }
            warn!("on-disk state diverges from the expected config; drift degradation disabled");
        } else {
            info!("validated on-disk state");
        }

        // Promote a validated pending config to current: annotations
        // first, then the state file, so a crash in between is re-entrant.
        let mut current = Arc::clone(&state.current);
        if let Some(pending) = &state.pending {
            self.deps
                .writer
                .set_done(&self.cfg.node_name, &pending.name_any())
                .await?;
            self.pending.clear()?;
            current = Arc::clone(pending);
        }

        // The desired config may have moved on while we were rebooting;
        // only uncordon when we're staying put.
        if Arc::ptr_eq(&current, &state.desired) {
            if state.pending.is_some() {
                info!(config = %current.name_any(), "completing pending config");
                self.complete_update(&current.name_any()).await?;
            }
            info!(config = %current.name_any(), "in desired config");
            return Ok(None);
        }

        self.trigger_update(Some(current), Some(Arc::clone(&state.desired)))
            .await
            .map(Some)
    }

    /// One normal reconcile tick for `key`.
    async fn sync_node(&mut self, key: &str) -> Result<Option<Diverged>, Error> {
        debug!(node = %key, "started syncing node");

        let Some(node) = self.deps.source.node(key).await? else {
            debug!(node = %key, "node has been deleted");
            return Ok(None);
        };
        if node.metadata.deletion_timestamp.is_some() {
            return Ok(None);
        }
        if node.metadata.name.as_deref() != Some(self.cfg.node_name.as_str()) {
            return Ok(None);
        }

        let node = Arc::new(node);
        self.node = Some(Arc::clone(&node));

        if self.prep_update_from_cluster(&node)? {
            return self.trigger_update(None, None).await.map(Some);
        }
        debug!(node = %key, "finished syncing node");
        Ok(None)
    }

    /// Compare the current and desired annotations by name.
    fn prep_update_from_cluster(&self, node: &Node) -> Result<bool, Error> {
        let desired = node_annotation_opt(node, DESIRED_CONFIG_ANNOTATION).unwrap_or_default();
        let current = node_annotation(node, CURRENT_CONFIG_ANNOTATION)?;
        if desired.is_empty() || desired == current {
            debug!("no updating is required");
            return Ok(false);
        }
        Ok(true)
    }

    /// Start an update, resolving whichever configs weren't passed from
    /// the cached node's annotations. Returns only on error.
    async fn trigger_update(
        &self,
        current: Option<Arc<MachineConfig>>,
        desired: Option<Arc<MachineConfig>>,
    ) -> Result<Diverged, Error> {
        let node = self
            .node
            .as_ref()
            .ok_or_else(|| Error::node("node not loaded"))?;

        let current = match current {
            Some(current) => current,
            None => {
                let name = node_annotation(node, CURRENT_CONFIG_ANNOTATION)?;
                self.deps.source.machine_config(name).await?
            }
        };
        let desired = match desired {
            Some(desired) => desired,
            None => {
                let name = node_annotation(node, DESIRED_CONFIG_ANNOTATION)?;
                self.deps.source.machine_config(name).await?
            }
        };

        self.updater.update(&current, &desired).await
    }

    /// Uncordon and announce a finished update.
    async fn complete_update(&self, config: &str) -> Result<(), Error> {
        self.deps.drainer.uncordon(&self.cfg.node_name).await?;
        info!(config = %config, "completed update");
        self.deps
            .events
            .publish(
                EventType::Normal,
                reasons::UPDATE_COMPLETE,
                "Update",
                Some(format!("node updated to config {config}")),
            )
            .await;
        Ok(())
    }

    /// Record the node as degraded; best-effort, never fails the caller.
    async fn degrade(&self, err: &Error) {
        if let Err(e) = self
            .deps
            .writer
            .set_degraded(&self.cfg.node_name, &err.to_string())
            .await
        {
            warn!(error = %e, "failed to record degraded state");
        }
        self.deps
            .events
            .publish(
                EventType::Warning,
                reasons::DEGRADED,
                "Sync",
                Some(format!("degraded: {err}")),
            )
            .await;
    }

    /// Decide between a rate-limited requeue and degrading the node.
    async fn handle_err(&mut self, key: &str, err: Error) {
        let count = {
            let count = self.retries.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if count < MAX_RETRIES {
            debug!(node = %key, attempt = count, error = %err, "error syncing node; requeueing");
            self.queue.add_after(key, rate_limited_delay(count));
            return;
        }

        warn!(node = %key, error = %err, "retry budget exhausted; dropping node out of the queue");
        self.degrade(&err).await;
        self.retries.remove(key);
        // Requeue far out so an external fix can be re-observed.
        self.queue.add_after(key, DEGRADED_REQUEUE_DELAY);
    }

    /// Apply a config from a local path or URL once, then stop.
    pub async fn run_once_from(&mut self, source: &str) -> Result<Option<Diverged>, Error> {
        info!(source = %source, "running once");
        let (config, origin) = once_from::sense_and_load_once_from(source).await?;
        match config {
            OnceFromConfig::Ignition(ignition) => {
                info!("once-from content is Ignition; applying directly");
                self.updater
                    .apply_bare(&ignition.files, &ignition.units)
                    .map(Some)
            }
            OnceFromConfig::MachineConfig(config) => match origin {
                ContentSource::Remote => {
                    // A cluster is expected to exist already.
                    info!("once-from content is a remote MachineConfig");
                    let node = self
                        .deps
                        .source
                        .node(&self.cfg.node_name)
                        .await?
                        .ok_or_else(|| {
                            Error::node(format!("node {} not found", self.cfg.node_name))
                        })?;
                    let node = Arc::new(node);
                    self.node = Some(Arc::clone(&node));

                    let need_update = match self.prep_update_from_cluster(&node) {
                        Ok(need_update) => need_update,
                        Err(e) => {
                            self.degrade(&e).await;
                            return Err(e);
                        }
                    };
                    if !need_update {
                        return Ok(None);
                    }
                    match self.trigger_update(None, Some(Arc::new(config))).await {
                        Ok(diverged) => Ok(Some(diverged)),
                        Err(e) => {
                            self.degrade(&e).await;
                            Err(e)
                        }
                    }
                }
                ContentSource::Local => {
                    // No cluster yet; update against an empty config.
                    info!("once-from content is a local MachineConfig");
                    let current = MachineConfig::new("", MachineConfigSpec::default());
                    self.updater.update(&current, &config).await.map(Some)
                }
            },
        }
    }
}

/// Requeue delay for the nth consecutive failure: 5ms doubling, capped.
fn rate_limited_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(20);
    (RETRY_BASE_DELAY * 2u32.saturating_pow(exp)).min(MAX_RETRY_DELAY)
}

/// Bind-mount `/run/secrets` under the target root so service-account
/// tokens remain visible after chroot. Must run before the chroot.
pub fn bind_pod_mounts(root: &std::path::Path, runner: &dyn CommandRunner) -> Result<(), Error> {
    let target = root.join("run/secrets");
    fs::create_dir_all(&target)?;
    let target = target.to_string_lossy().into_owned();
    runner
        .run("mount", &["--rbind".into(), "/run/secrets".into(), target])?
        .require_success("bind-mounting /run/secrets")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::FileSpec;
    use crate::dataurl;
    use crate::events::MockEventPublisher;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use crate::node::{MockDrainer, MockNodeWriter, STATE_ANNOTATION};
    use crate::osimage::MockNodeUpdater;
    use crate::resolver::MockConfigSource;
    use crate::{PATH_BOOT_ID, PATH_STATE_JSON};
    use base64::Engine;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const DIGEST_A: &str =
        "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const DIGEST_B: &str =
        "sha256:fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

    struct Mocks {
        source: MockConfigSource,
        writer: MockNodeWriter,
        drainer: MockDrainer,
        node_updater: MockNodeUpdater,
        events: MockEventPublisher,
        runner: MockCommandRunner,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                source: MockConfigSource::new(),
                writer: MockNodeWriter::new(),
                drainer: MockDrainer::new(),
                node_updater: MockNodeUpdater::new(),
                events: MockEventPublisher::new(),
                runner: MockCommandRunner::new(),
            }
        }
    }

    fn build(root: &TempDir, mocks: Mocks, os: OperatingSystem) -> Daemon {
        let cfg = DaemonConfig {
            node_name: "worker-0".to_string(),
            os,
            root: root.path().to_path_buf(),
            once_from: None,
            kubelet_healthz_enabled: false,
            kubelet_healthz_endpoint: crate::health::KUBELET_HEALTHZ_ENDPOINT.to_string(),
            degrade_on_drift: true,
        };
        let deps = Deps {
            source: Arc::new(mocks.source),
            writer: Arc::new(mocks.writer),
            drainer: Arc::new(mocks.drainer),
            node_updater: Arc::new(mocks.node_updater),
            events: Arc::new(mocks.events),
            runner: Arc::new(mocks.runner),
        };
        Daemon::new(cfg, deps).unwrap()
    }

    fn seed_boot_id(root: &TempDir, boot_id: &str) {
        let path = rooted(root.path(), PATH_BOOT_ID);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, format!("{boot_id}\n")).unwrap();
    }

    fn node_at(current: &str, desired: &str) -> Node {
        let mut annotations = BTreeMap::new();
        annotations.insert(CURRENT_CONFIG_ANNOTATION.to_string(), current.to_string());
        annotations.insert(DESIRED_CONFIG_ANNOTATION.to_string(), desired.to_string());
        annotations.insert(STATE_ANNOTATION.to_string(), "Done".to_string());
        let mut node = Node::default();
        node.metadata.name = Some("worker-0".to_string());
        node.metadata.annotations = Some(annotations);
        node
    }

    fn data_url(text: &str) -> String {
        format!(
            "data:;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(text)
        )
    }

    fn file_spec(path: &str, text: &str) -> FileSpec {
        FileSpec {
            path: path.to_string(),
            contents: data_url(text),
            mode: None,
        }
    }

    fn config(name: &str, spec: MachineConfigSpec) -> Arc<MachineConfig> {
        Arc::new(MachineConfig::new(name, spec))
    }

    fn place_on_disk(root: &TempDir, config: &MachineConfig) {
        for f in &config.spec.files {
            let full = rooted(root.path(), &f.path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(&full, dataurl::decode(&f.contents).unwrap()).unwrap();
            fs::set_permissions(&full, fs::Permissions::from_mode(0o644)).unwrap();
        }
    }

    fn expect_node(source: &mut MockConfigSource, node: Node) {
        source
            .expect_node()
            .returning(move |_| Ok(Some(node.clone())));
    }

    fn expect_config(source: &mut MockConfigSource, config: &Arc<MachineConfig>) {
        let config = Arc::clone(config);
        source
            .expect_machine_config()
            .with(eq(config.name_any()))
            .returning(move |_| Ok(Arc::clone(&config)));
    }

    fn expect_quiet_journal(runner: &mut MockCommandRunner) {
        runner
            .expect_run()
            .withf(|program, _| program == "journalctl")
            .returning(|_, _| {
                Ok(CommandOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });
    }

    fn expect_reboot(runner: &mut MockCommandRunner) {
        runner
            .expect_run()
            .withf(|program, args| program == "systemctl" && args == ["reboot"])
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });
    }

    fn expect_event(events: &mut MockEventPublisher, reason: &'static str) {
        events
            .expect_publish()
            .withf(move |_, r, _, _| r == reason)
            .times(1)
            .returning(|_, _, _, _| ());
    }

    fn pending_file(root: &TempDir) -> Option<serde_json::Value> {
        let raw = fs::read(rooted(root.path(), PATH_STATE_JSON)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    // S1: current == desired, on-disk matches. No writes, no events.
    #[tokio::test]
    async fn test_noop_sync_at_rest() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");
        let a = config(
            "A",
            MachineConfigSpec {
                files: vec![file_spec("/etc/foo", "alpha\n")],
                ..Default::default()
            },
        );
        place_on_disk(&root, &a);

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "A"));
        expect_config(&mut mocks.source, &a);
        expect_quiet_journal(&mut mocks.runner);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        assert!(matches!(
            daemon.bootstrap_tick().await.unwrap(),
            BootOutcome::Synced
        ));

        // A normal tick afterwards is a no-op as well.
        assert!(daemon.sync_node("worker-0").await.unwrap().is_none());
    }

    // S2: desired moved to B. Cordon+drain, stage B, write pending, reboot.
    #[tokio::test]
    async fn test_fresh_update_stages_and_reboots() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");
        let a = config(
            "A",
            MachineConfigSpec {
                files: vec![file_spec("/etc/foo", "alpha\n")],
                ..Default::default()
            },
        );
        let b = config(
            "B",
            MachineConfigSpec {
                files: vec![file_spec("/etc/foo", "bravo\n")],
                ..Default::default()
            },
        );
        place_on_disk(&root, &a);

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "B"));
        expect_config(&mut mocks.source, &a);
        expect_config(&mut mocks.source, &b);
        mocks
            .writer
            .expect_set_working()
            .with(eq("worker-0"))
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .drainer
            .expect_drain()
            .with(eq("worker-0"))
            .times(1)
            .returning(|_| Ok(()));
        expect_event(&mut mocks.events, reasons::UPDATE_STARTED);
        expect_reboot(&mut mocks.runner);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        let diverged = daemon.sync_node("worker-0").await.unwrap();
        assert!(diverged.is_some());

        let on_disk = fs::read_to_string(rooted(root.path(), "/etc/foo")).unwrap();
        assert_eq!(on_disk, "bravo\n");

        let state = pending_file(&root).expect("pending state written");
        assert_eq!(state["pendingConfig"], "B");
        assert_eq!(state["bootID"], "bid0");
    }

    // S3: fresh boot with a pending record from the previous boot and
    // matching on-disk state. Finalize: annotations, state file, uncordon.
    #[tokio::test]
    async fn test_post_reboot_finalize() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid1");
        PendingStateStore::new(root.path(), "bid0")
            .write_pending("B")
            .unwrap();

        let a = config("A", MachineConfigSpec::default());
        let b = config(
            "B",
            MachineConfigSpec {
                files: vec![file_spec("/etc/foo", "bravo\n")],
                ..Default::default()
            },
        );
        place_on_disk(&root, &b);

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "B"));
        expect_config(&mut mocks.source, &a);
        expect_config(&mut mocks.source, &b);
        expect_quiet_journal(&mut mocks.runner);
        mocks
            .writer
            .expect_set_done()
            .with(eq("worker-0"), eq("B"))
            .times(1)
            .returning(|_, _| Ok(()));
        mocks
            .drainer
            .expect_uncordon()
            .with(eq("worker-0"))
            .times(1)
            .returning(|_| Ok(()));
        expect_event(&mut mocks.events, reasons::UPDATE_COMPLETE);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        assert!(matches!(
            daemon.bootstrap_tick().await.unwrap(),
            BootOutcome::Synced
        ));
        assert!(pending_file(&root).is_none());
    }

    // S4: pending record carries the current boot ID. Fatal; no mutations.
    #[tokio::test]
    async fn test_reboot_loop_guard() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");
        PendingStateStore::new(root.path(), "bid0")
            .write_pending("B")
            .unwrap();

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "B"));

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        let err = daemon.bootstrap_tick().await.unwrap_err();
        assert!(err.is_fatal());

        // The state file is untouched, and the strict mocks guarantee no
        // cluster write was issued.
        assert_eq!(pending_file(&root).unwrap()["pendingConfig"], "B");
    }

    // S5: post-reboot but the on-disk file was tampered with. Validation
    // fails, the node degrades, annotations stay.
    #[tokio::test]
    async fn test_drift_detected_degrades() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid1");
        PendingStateStore::new(root.path(), "bid0")
            .write_pending("B")
            .unwrap();

        let a = config("A", MachineConfigSpec::default());
        let b = config(
            "B",
            MachineConfigSpec {
                files: vec![file_spec("/etc/foo", "bravo\n")],
                ..Default::default()
            },
        );
        // Tampered contents on disk.
        place_on_disk(
            &root,
            &config(
                "B",
                MachineConfigSpec {
                    files: vec![file_spec("/etc/foo", "tampered\n")],
                    ..Default::default()
                },
            ),
        );

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "B"));
        expect_config(&mut mocks.source, &a);
        expect_config(&mut mocks.source, &b);
        expect_quiet_journal(&mut mocks.runner);
        mocks
            .writer
            .expect_set_degraded()
            .withf(|_, reason| reason.contains("unexpected on-disk state"))
            .times(1)
            .returning(|_, _| Ok(()));
        expect_event(&mut mocks.events, reasons::DEGRADED);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        let err = daemon.bootstrap_tick().await.unwrap_err();
        assert!(matches!(err, Error::Drift(_)));
        assert!(!err.is_fatal());
        daemon.degrade(&err).await;

        // No finalize happened: the pending record is still there.
        assert_eq!(pending_file(&root).unwrap()["pendingConfig"], "B");
    }

    // S6: bootstrap mode with a booted OS that doesn't match the current
    // config. OS-only pivot: stage, write pending, reboot; sentinel stays.
    #[tokio::test]
    async fn test_bootstrap_os_pivot() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");
        let sentinel = rooted(root.path(), PATH_INITIAL_ANNOTATIONS);
        fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        fs::write(&sentinel, b"{}").unwrap();

        let target = format!("registry.example.com/os@{DIGEST_B}");
        let a = config(
            "A",
            MachineConfigSpec {
                os_image_url: target.clone(),
                ..Default::default()
            },
        );

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "A"));
        expect_config(&mut mocks.source, &a);
        expect_quiet_journal(&mut mocks.runner);
        expect_reboot(&mut mocks.runner);
        mocks
            .node_updater
            .expect_booted_os_image_url()
            .returning(|_| Ok((format!("registry.example.com/os@{DIGEST_A}"), "49.1".into())));
        mocks
            .node_updater
            .expect_status()
            .returning(|| Ok("deployment ok".to_string()));
        mocks
            .node_updater
            .expect_stage_os_update()
            .with(eq(target.clone()))
            .times(1)
            .returning(|_| Ok(()));
        expect_event(&mut mocks.events, reasons::BOOTSTRAP_PIVOT);

        let mut daemon = build(&root, mocks, OperatingSystem::ImageBased);
        assert!(matches!(
            daemon.bootstrap_tick().await.unwrap(),
            BootOutcome::Rebooting
        ));

        // Sentinel intact: the post-pivot boot re-enters bootstrap mode.
        assert!(sentinel.exists());
        assert_eq!(pending_file(&root).unwrap()["pendingConfig"], "A");
    }

    // Bootstrap with a matching OS removes the sentinel so later drift
    // is caught.
    #[tokio::test]
    async fn test_bootstrap_no_pivot_unlinks_sentinel() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");
        let sentinel = rooted(root.path(), PATH_INITIAL_ANNOTATIONS);
        fs::create_dir_all(sentinel.parent().unwrap()).unwrap();
        fs::write(&sentinel, b"{}").unwrap();

        let booted = format!("registry.example.com/os@{DIGEST_A}");
        let a = config(
            "A",
            MachineConfigSpec {
                os_image_url: booted.clone(),
                ..Default::default()
            },
        );

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "A"));
        expect_config(&mut mocks.source, &a);
        expect_quiet_journal(&mut mocks.runner);
        let booted_for_mock = booted.clone();
        mocks
            .node_updater
            .expect_booted_os_image_url()
            .returning(move |_| Ok((booted_for_mock.clone(), "49.1".into())));
        mocks
            .node_updater
            .expect_status()
            .returning(|| Ok("deployment ok".to_string()));

        let mut daemon = build(&root, mocks, OperatingSystem::ImageBased);
        assert!(matches!(
            daemon.bootstrap_tick().await.unwrap(),
            BootOutcome::Synced
        ));
        assert!(!sentinel.exists());
    }

    // Property 6: after MAX_RETRIES consecutive sync errors, exactly one
    // degrade is recorded and the key is requeued far out.
    #[tokio::test]
    async fn test_retry_budget_degrades_exactly_once() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");

        let mut mocks = Mocks::new();
        mocks
            .writer
            .expect_set_degraded()
            .times(1)
            .returning(|_, _| Ok(()));
        expect_event(&mut mocks.events, reasons::DEGRADED);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        for _ in 0..MAX_RETRIES {
            daemon
                .handle_err("worker-0", Error::config("lister miss"))
                .await;
        }
        assert!(daemon.retries.get("worker-0").is_none());
    }

    #[tokio::test]
    async fn test_queue_debounces_duplicate_keys() {
        let (queue, mut rx) = WorkQueue::new();
        for _ in 0..5 {
            queue.add_after("worker-0", Duration::from_millis(1));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(rx.try_recv().unwrap(), "worker-0");
        assert!(rx.try_recv().is_err());

        // Dequeueing re-arms the key.
        queue.mark_dequeued("worker-0");
        queue.add_after("worker-0", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv().unwrap(), "worker-0");
    }

    #[test]
    fn test_rate_limited_delay_doubles_from_base() {
        assert_eq!(rate_limited_delay(1), Duration::from_millis(5));
        assert_eq!(rate_limited_delay(2), Duration::from_millis(10));
        assert_eq!(rate_limited_delay(4), Duration::from_millis(40));
        assert!(rate_limited_delay(60) <= MAX_RETRY_DELAY);
    }

    // A sync for a node that isn't ours is skipped without any reads
    // beyond the node itself.
    #[tokio::test]
    async fn test_sync_skips_foreign_node() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");

        let mut mocks = Mocks::new();
        let mut other = node_at("A", "B");
        other.metadata.name = Some("worker-1".to_string());
        expect_node(&mut mocks.source, other);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        assert!(daemon.sync_node("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drift_tolerated_when_degrade_disabled() {
        let root = TempDir::new().unwrap();
        seed_boot_id(&root, "bid0");
        let a = config(
            "A",
            MachineConfigSpec {
                files: vec![file_spec("/etc/foo", "alpha\n")],
                ..Default::default()
            },
        );
        // Nothing placed on disk: validation would fail.

        let mut mocks = Mocks::new();
        expect_node(&mut mocks.source, node_at("A", "A"));
        expect_config(&mut mocks.source, &a);
        expect_quiet_journal(&mut mocks.runner);

        let mut daemon = build(&root, mocks, OperatingSystem::Generic);
        daemon.cfg.degrade_on_drift = false;
        assert!(matches!(
            daemon.bootstrap_tick().await.unwrap(),
            BootOutcome::Synced
        ));
    }
}
