//! Applying a MachineConfig to the host.
//!
//! The update path is: drain, stage files and systemd units, replace
//! managed SSH keys, stage the OS image, persist the pending record, and
//! reboot. Success is terminal: the machine is rebooting, and the
//! [`Diverged`] marker is constructible only by the reboot path, so "the
//! update succeeded but nothing rebooted" is unrepresentable.
//!
//! All filesystem mutations are restartable; writes go through an atomic
//! temp-and-rename so a retried update fully overwrites partial state.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::{FileSpec, MachineConfig, PasswdUser, SystemdUnit};
use crate::error::Error;
use crate::events::{reasons, EventPublisher};
use crate::exec::CommandRunner;
use crate::node::{Drainer, NodeWriter};
use crate::osimage::{compare_os_image_url, NodeUpdater, OperatingSystem};
use crate::pending::PendingStateStore;
use crate::{dataurl, rooted, DEFAULT_FILE_MODE, PATH_DEV_NULL, PATH_SYSTEMD, PATH_SYSTEMD_WANTS};

/// Proof that a reboot was requested. An update returning this has no
/// successor state in this process.
pub struct Diverged(());

/// Stages config changes on the host and drives the reboot.
pub struct Updater {
    root: PathBuf,
    os: OperatingSystem,
    booted_os_image_url: String,
    node_name: String,
    pending: PendingStateStore,
    node_updater: Arc<dyn NodeUpdater>,
    drainer: Arc<dyn Drainer>,
    writer: Arc<dyn NodeWriter>,
    events: Arc<dyn EventPublisher>,
    runner: Arc<dyn CommandRunner>,
}

impl Updater {
    /// Create an updater over the given host root and collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: impl Into<PathBuf>,
        os: OperatingSystem,
        booted_os_image_url: impl Into<String>,
        node_name: impl Into<String>,
        pending: PendingStateStore,
        node_updater: Arc<dyn NodeUpdater>,
        drainer: Arc<dyn Drainer>,
        writer: Arc<dyn NodeWriter>,
        events: Arc<dyn EventPublisher>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            os,
            booted_os_image_url: booted_os_image_url.into(),
            node_name: node_name.into(),
            pending,
            node_updater,
            drainer,
            writer,
            events,
            runner,
        }
    }

    /// Drive the node from `current` to `desired`. Returns only on error;
    /// on success the machine is rebooting.
    pub async fn update(
        &self,
        current: &MachineConfig,
        desired: &MachineConfig,
    ) -> Result<Diverged, Error> {
        let desired_name = desired.name_any();
        info!(
            current = %current.name_any(),
            desired = %desired_name,
            "starting update"
        );
        self.writer.set_working(&self.node_name).await?;
        self.events
            .publish(
                EventType::Normal,
                reasons::UPDATE_STARTED,
                "Update",
                Some(format!("updating node to config {desired_name}")),
            )
            .await;

        self.drainer.drain(&self.node_name).await?;

        self.write_files(&desired.spec.files)?;
        self.write_units(&desired.spec.units)?;
        self.write_ssh_keys(&desired.spec.ssh_users)?;

        if self.os == OperatingSystem::ImageBased
            && !compare_os_image_url(&self.booted_os_image_url, &desired.spec.os_image_url)?
        {
            info!(target = %desired.spec.os_image_url, "staging OS image update");
            self.node_updater.stage_os_update(&desired.spec.os_image_url)?;
        }

        self.pending.write_pending(&desired_name)?;
        self.reboot(&format!("applying config {desired_name}"))
    }

    /// Stage only the OS image from `config` and reboot. Used on the
    /// bootstrap path when the booted image doesn't match the current
    /// config.
    pub async fn update_os_and_reboot(&self, config: &MachineConfig) -> Result<Diverged, Error> {
        self.events
            .publish(
                EventType::Normal,
                reasons::BOOTSTRAP_PIVOT,
                "Update",
                Some(format!("pivoting to {}", config.spec.os_image_url)),
            )
            .await;
        self.node_updater.stage_os_update(&config.spec.os_image_url)?;
        self.pending.write_pending(&config.name_any())?;
        self.reboot(&format!("bootstrap pivot to {}", config.spec.os_image_url))
    }

    /// Lay down files and units without any cluster interaction, then
    /// reboot. Used by the standalone Ignition once-from mode.
    pub fn apply_bare(&self, files: &[FileSpec], units: &[SystemdUnit]) -> Result<Diverged, Error> {
        self.write_files(files)?;
        self.write_units(units)?;
        self.reboot("standalone provisioning complete")
    }

    fn reboot(&self, reason: &str) -> Result<Diverged, Error> {
        info!(reason, "initiating reboot");
        self.runner
            .run("systemctl", &["reboot".into()])?
            .require_success("systemctl reboot")?;
        Ok(Diverged(()))
    }

    /// Write declared files. Reverse-order de-duplication matches the
    /// validator: when a path repeats, the last occurrence wins.
    pub(crate) fn write_files(&self, files: &[FileSpec]) -> Result<(), Error> {
        let mut written: HashSet<&str> = HashSet::new();
        for f in files.iter().rev() {
            if !written.insert(f.path.as_str()) {
                continue;
            }
            let contents = dataurl::decode(&f.contents).map_err(|e| {
                Error::unsupported(format!("decoding contents of {}: {e}", f.path))
            })?;
            let mode = f.mode.unwrap_or(DEFAULT_FILE_MODE);
            self.write_file_atomic(&f.path, &contents, mode)?;
        }
        Ok(())
    }

    /// Write unit bodies, drop-ins, mask symlinks, and enablement links.
    pub(crate) fn write_units(&self, units: &[SystemdUnit]) -> Result<(), Error> {
        for unit in units {
            for dropin in &unit.dropins {
                let path = format!("{PATH_SYSTEMD}/{}.d/{}", unit.name, dropin.name);
                self.write_file_atomic(&path, dropin.contents.as_bytes(), DEFAULT_FILE_MODE)?;
            }

            let unit_path = format!("{PATH_SYSTEMD}/{}", unit.name);
            if unit.mask {
                debug!(unit = %unit.name, "masking unit");
                self.replace_symlink(PATH_DEV_NULL, &unit_path)?;
                continue;
            }
            if !unit.contents.is_empty() {
                self.write_file_atomic(&unit_path, unit.contents.as_bytes(), DEFAULT_FILE_MODE)?;
            }
            if unit.enabled {
                debug!(unit = %unit.name, "enabling unit");
                let link = format!("{PATH_SYSTEMD_WANTS}/{}", unit.name);
                self.replace_symlink(&unit_path, &link)?;
            }
        }
        Ok(())
    }

    /// Atomically replace the authorized_keys file for the first declared
    /// user carrying SSH keys; the rest are not handled today.
    pub(crate) fn write_ssh_keys(&self, users: &[PasswdUser]) -> Result<(), Error> {
        let Some(user) = users.iter().find(|u| !u.ssh_authorized_keys.is_empty()) else {
            return Ok(());
        };
        let path = format!("/home/{}/.ssh/authorized_keys", user.name);
        let mut contents = user.ssh_authorized_keys.join("\n");
        contents.push('\n');
        info!(user = %user.name, "writing SSH keys");
        self.write_file_atomic(&path, contents.as_bytes(), 0o600)
    }

    /// Write-to-temp + fsync + rename, with intermediate directories
    /// created as needed.
    fn write_file_atomic(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), Error> {
        let full = rooted(&self.root, path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = full.with_extension("machined-tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &full)?;
        debug!(path = %full.display(), mode = format_args!("{:o}", mode), "wrote file");
        Ok(())
    }

    /// Point `link` at `target`, replacing whatever was there.
    fn replace_symlink(&self, target: &str, link: &str) -> Result<(), Error> {
        let full = rooted(&self.root, link);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&full) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        symlink(target, &full)?;
        Ok(())
    }
}
