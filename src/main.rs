//! machined - per-node machine configuration reconciler

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::{reflector, store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use machined::crd::MachineConfig;
use machined::daemon::{bind_pod_mounts, Daemon, DaemonConfig, Deps, WorkQueue, UPDATE_DELAY};
use machined::events::{KubeEventPublisher, NoopEventPublisher};
use machined::exec::RealCommandRunner;
use machined::health::KUBELET_HEALTHZ_ENDPOINT;
use machined::node::{KubeDrainer, KubeNodeWriter, OfflineDrainer, OfflineNodeWriter};
use machined::once_from::looks_like_path;
use machined::osimage::{OperatingSystem, OstreeNodeUpdater};
use machined::resolver::{CachedConfigSource, ConfigSource};
use machined::Error;

/// machined - watches the node's desired MachineConfig annotation and
/// drives the host through drain, stage, reboot, and validate.
#[derive(Parser, Debug)]
#[command(name = "machined", version, about, long_about = None)]
struct Cli {
    /// Name of the node this daemon manages
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Operating system flavor
    #[arg(long, value_enum, default_value_t = OperatingSystem::Generic)]
    os: OperatingSystem,

    /// Host root to chroot into before reconciling
    #[arg(long, default_value = "/")]
    root_mount: PathBuf,

    /// Apply a config from this local path or URL once, then exit
    #[arg(long)]
    once_from: Option<String>,

    /// Poll the kubelet healthz endpoint
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    kubelet_healthz_enabled: bool,

    /// Kubelet healthz endpoint URL
    #[arg(long, default_value = KUBELET_HEALTHZ_ENDPOINT)]
    kubelet_healthz_endpoint: String,

    /// Degrade the node when boot-time validation detects drift
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    degrade_on_drift: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let runner = Arc::new(RealCommandRunner);

    // Move into the host's filesystem. The bind mount keeps
    // service-account tokens visible inside the chroot.
    if cli.root_mount != Path::new("/") {
        bind_pod_mounts(&cli.root_mount, runner.as_ref())
            .context("bind-mounting /run/secrets into the host root")?;
        std::os::unix::fs::chroot(&cli.root_mount).with_context(|| {
            format!("chrooting into {}", cli.root_mount.display())
        })?;
        std::env::set_current_dir("/").context("entering chroot")?;
    }

    let cfg = DaemonConfig {
        node_name: cli.node_name.clone(),
        os: cli.os,
        root: PathBuf::from("/"),
        once_from: cli.once_from.clone(),
        kubelet_healthz_enabled: cli.kubelet_healthz_enabled,
        kubelet_healthz_endpoint: cli.kubelet_healthz_endpoint.clone(),
        degrade_on_drift: cli.degrade_on_drift,
    };
    let node_updater = Arc::new(OstreeNodeUpdater::new(runner.clone()));

    // A local once-from source runs before any cluster exists; wire the
    // daemon with offline collaborators and skip the client entirely.
    let offline = cli
        .once_from
        .as_deref()
        .is_some_and(looks_like_path);
    if offline {
        let deps = Deps {
            source: Arc::new(OfflineConfigSource),
            writer: Arc::new(OfflineNodeWriter),
            drainer: Arc::new(OfflineDrainer),
            node_updater,
            events: Arc::new(NoopEventPublisher),
            runner,
        };
        let daemon = Daemon::new(cfg, deps).context("setting up daemon")?;
        daemon
            .run(CancellationToken::new())
            .await
            .context("once-from run failed")?;
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .context("creating kubernetes client")?;

    let (node_reader, node_store_writer) = store::<Node>();
    let (mc_reader, mc_store_writer) = store::<MachineConfig>();

    let deps = Deps {
        source: Arc::new(CachedConfigSource::new(
            node_reader.clone(),
            mc_reader.clone(),
        )),
        writer: Arc::new(KubeNodeWriter::new(client.clone())),
        drainer: Arc::new(KubeDrainer::new(client.clone())),
        node_updater,
        events: Arc::new(KubeEventPublisher::new(
            client.clone(),
            "machined",
            &cli.node_name,
        )),
        runner,
    };
    let daemon = Daemon::new(cfg, deps).context("setting up daemon")?;
    let queue = daemon.queue_handle();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    spawn_watches(
        client,
        &cli.node_name,
        node_store_writer,
        mc_store_writer,
        queue,
    );

    // The boot-time check must not run against a cold cache.
    node_reader
        .wait_until_ready()
        .await
        .context("node cache sync")?;
    mc_reader
        .wait_until_ready()
        .await
        .context("machine config cache sync")?;
    tracing::info!(node = %cli.node_name, "caches synced");

    daemon.run(cancel).await.context("daemon failed")?;
    Ok(())
}

/// Drive the node and MachineConfig reflectors; node events enqueue the
/// node name behind the churn-absorbing delay.
fn spawn_watches(
    client: Client,
    node_name: &str,
    node_store_writer: store::Writer<Node>,
    mc_store_writer: store::Writer<MachineConfig>,
    queue: WorkQueue,
) {
    let nodes: Api<Node> = Api::all(client.clone());
    let node_watch_cfg =
        watcher::Config::default().fields(&format!("metadata.name={node_name}"));
    tokio::spawn(async move {
        let stream = reflector(node_store_writer, watcher(nodes, node_watch_cfg))
            .applied_objects();
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(node) => queue.add_after(&node.name_any(), UPDATE_DELAY),
                Err(e) => tracing::warn!(error = %e, "node watch error"),
            }
        }
    });

    let configs: Api<MachineConfig> = Api::all(client);
    tokio::spawn(async move {
        let stream = reflector(mc_store_writer, watcher(configs, watcher::Config::default()))
            .applied_objects();
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let Err(e) = event {
                tracing::warn!(error = %e, "machine config watch error");
            }
        }
    });
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!(error = %e, "installing SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received interrupt"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}

/// ConfigSource for cluster-less once-from runs; any lookup is a bug.
struct OfflineConfigSource;

#[async_trait::async_trait]
impl ConfigSource for OfflineConfigSource {
    async fn node(&self, name: &str) -> Result<Option<Node>, Error> {
        Err(Error::config(format!(
            "no cluster available to look up node {name}"
        )))
    }

    async fn machine_config(&self, name: &str) -> Result<Arc<MachineConfig>, Error> {
        Err(Error::config(format!(
            "no cluster available to look up machine config {name}"
        )))
    }
}
