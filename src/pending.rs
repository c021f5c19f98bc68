//! Boot-persistent pending-config state.
//!
//! After staging a new config the daemon records `{pendingConfig, bootID}`
//! on disk and reboots. The record surviving into the *same* boot means the
//! reboot never happened; that is fatal, to keep the node out of a reboot
//! loop. The record surviving into a *new* boot is the signal to validate
//! and finalize the update.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::{rooted, PATH_BOOT_ID, PATH_STATE_JSON};

/// On-disk shape of the transient state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct PendingState {
    #[serde(default, rename = "pendingConfig")]
    pending_config: String,
    #[serde(default, rename = "bootID")]
    boot_id: String,
}

/// Store for the transient pending-config record.
#[derive(Debug, Clone)]
pub struct PendingStateStore {
    path: PathBuf,
    boot_id: String,
}

impl PendingStateStore {
    /// Create a store rooted at `root`, bound to the current boot's ID.
    pub fn new(root: &Path, boot_id: impl Into<String>) -> Self {
        Self {
            path: rooted(root, PATH_STATE_JSON),
            boot_id: boot_id.into(),
        }
    }

    /// The boot ID this store was created with.
    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    /// Load the pending config name, if any.
    ///
    /// Returns `Ok(None)` when no record exists. Fails with
    /// [`Error::RebootLoop`] when the stored boot ID equals the current one.
    pub fn load_pending(&self) -> Result<Option<String>, Error> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::host(format!("loading transient state: {e}"))),
        };
        let state: PendingState = serde_json::from_slice(&raw)
            .map_err(|e| Error::host(format!("parsing transient state: {e}")))?;

        if state.pending_config.is_empty() {
            return Ok(None);
        }
        if state.boot_id == self.boot_id {
            return Err(Error::RebootLoop {
                config: state.pending_config,
                boot_id: self.boot_id.clone(),
            });
        }
        debug!(config = %state.pending_config, "loaded pending config");
        Ok(Some(state.pending_config))
    }

    /// Record `name` as pending for the current boot.
    ///
    /// The write goes to a sibling temp file which is fsynced and renamed
    /// into place, so a crash mid-write never leaves a partial record.
    pub fn write_pending(&self, name: &str) -> Result<(), Error> {
        let state = PendingState {
            pending_config: name.to_string(),
            boot_id: self.boot_id.clone(),
        };
        let raw = serde_json::to_vec(&state)
            .map_err(|e| Error::host(format!("encoding transient state: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&raw)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        debug!(config = %name, path = %self.path.display(), "wrote pending config");
        Ok(())
    }

    /// Remove the pending record. Errors if no record exists.
    pub fn clear(&self) -> Result<(), Error> {
        fs::remove_file(&self.path)
            .map_err(|e| Error::host(format!("removing transient state file: {e}")))
    }
}

/// Read the kernel-generated boot ID for the current boot.
pub fn read_boot_id(root: &Path) -> Result<String, Error> {
    let raw = fs::read_to_string(rooted(root, PATH_BOOT_ID))
        .map_err(|e| Error::host(format!("reading boot id: {e}")))?;
    Ok(raw.trim().to_string())
}
