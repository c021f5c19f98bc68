//! On-disk state validation.
//!
//! Compares the node's actual filesystem against what a MachineConfig
//! specifies. If an admin ssh'd in and edited a file, or another agent is
//! stomping on managed paths, validation highlights that so the node can
//! be marked degraded instead of silently drifting.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::crd::{FileSpec, MachineConfig, SystemdUnit};
use crate::error::Error;
use crate::osimage::{compare_os_image_url, OperatingSystem};
use crate::{dataurl, rooted, DEFAULT_FILE_MODE, PATH_DEV_NULL, PATH_SYSTEMD};

/// Validates a MachineConfig against the filesystem it should describe.
pub struct OnDiskValidator {
    root: PathBuf,
    os: OperatingSystem,
    booted_os_image_url: String,
}

impl OnDiskValidator {
    /// Create a validator rooted at `root` (`/` in production).
    pub fn new(
        root: impl Into<PathBuf>,
        os: OperatingSystem,
        booted_os_image_url: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            os,
            booted_os_image_url: booted_os_image_url.into(),
        }
    }

    /// Check OS image, files, and systemd units, in that order.
    ///
    /// Any single mismatch short-circuits to `false` with a logged reason.
    pub fn validate(&self, config: &MachineConfig) -> bool {
        match self.check_os(&config.spec.os_image_url) {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    expected = %config.spec.os_image_url,
                    booted = %self.booted_os_image_url,
                    "booted OS image does not match the target"
                );
                return false;
            }
            Err(e) => {
                error!(error = %e, "could not compare OS image URLs");
                return false;
            }
        }
        self.check_files(&config.spec.files) && self.check_units(&config.spec.units)
    }

    /// OS image check; trivially true off the image-based OS.
    pub fn check_os(&self, target: &str) -> Result<bool, Error> {
        if self.os != OperatingSystem::ImageBased {
            debug!(target, "not an image-based OS, skipping OS image check");
            return Ok(true);
        }
        compare_os_image_url(&self.booted_os_image_url, target)
    }

    /// Validate declared files. Iterates in reverse so that when a path
    /// appears more than once, only the last occurrence is checked.
    fn check_files(&self, files: &[FileSpec]) -> bool {
        let mut checked: HashSet<&str> = HashSet::new();
        for f in files.iter().rev() {
            if !checked.insert(f.path.as_str()) {
                continue;
            }
            let contents = match dataurl::decode(&f.contents) {
                Ok(contents) => contents,
                Err(e) => {
                    error!(path = %f.path, error = %e, "couldn't parse declared file contents");
                    return false;
                }
            };
            let mode = f.mode.unwrap_or(DEFAULT_FILE_MODE);
            if !self.check_file_contents_and_mode(&f.path, &contents, mode) {
                return false;
            }
        }
        true
    }

    /// Validate declared units: every drop-in, mask symlinks, unit bodies.
    fn check_units(&self, units: &[SystemdUnit]) -> bool {
        for unit in units {
            for dropin in &unit.dropins {
                let path = format!("{PATH_SYSTEMD}/{}.d/{}", unit.name, dropin.name);
                if !self.check_file_contents_and_mode(
                    &path,
                    dropin.contents.as_bytes(),
                    DEFAULT_FILE_MODE,
                ) {
                    return false;
                }
            }

            let path = format!("{PATH_SYSTEMD}/{}", unit.name);
            if unit.mask {
                if !self.check_masked(&path) {
                    return false;
                }
                continue;
            }
            if unit.contents.is_empty() {
                continue;
            }
            if !self.check_file_contents_and_mode(
                &path,
                unit.contents.as_bytes(),
                DEFAULT_FILE_MODE,
            ) {
                return false;
            }
        }
        true
    }

    /// A masked unit's path must be a symlink resolving to /dev/null.
    fn check_masked(&self, path: &str) -> bool {
        let full = rooted(&self.root, path);
        match fs::canonicalize(&full) {
            Ok(target) if target == Path::new(PATH_DEV_NULL) => true,
            Ok(target) => {
                error!(
                    path = %full.display(),
                    target = %target.display(),
                    "masked unit does not resolve to /dev/null"
                );
                false
            }
            Err(e) => {
                error!(path = %full.display(), error = %e, "couldn't resolve masked unit symlink");
                false
            }
        }
    }

    /// Stat `path` under the root and compare mode and byte contents.
    fn check_file_contents_and_mode(&self, path: &str, expected: &[u8], mode: u32) -> bool {
        let full = rooted(&self.root, path);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) => {
                error!(path = %full.display(), error = %e, "could not stat file");
                return false;
            }
        };
        if !meta.is_file() {
            error!(path = %full.display(), "expected a regular file");
            return false;
        }
        let got = meta.permissions().mode() & 0o7777;
        if got != mode {
            error!(
                path = %full.display(),
                expected = format_args!("{:o}", mode),
                received = format_args!("{:o}", got),
                "mode mismatch"
            );
            return false;
        }
        let contents = match fs::read(&full) {
            Ok(contents) => contents,
            Err(e) => {
                error!(path = %full.display(), error = %e, "could not read file");
                return false;
            }
        };
        if contents != expected {
            error!(path = %full.display(), "content mismatch");
            return false;
        }
        true
    }
}
