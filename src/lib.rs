//! machined - per-node machine configuration reconciler
//!
//! The daemon watches its node's annotations for a desired [`crd::MachineConfig`],
//! and when the desired config diverges from the current one it drives the node
//! through a safe update: drain, stage files and systemd units, stage the OS
//! image, persist a pending record across the reboot boundary, reboot, and on
//! the next boot validate that the staged state was actually applied.

use std::path::{Path, PathBuf};

pub mod crd;
pub mod daemon;
pub mod dataurl;
pub mod error;
pub mod events;
pub mod exec;
pub mod health;
pub mod journal;
pub mod node;
pub mod once_from;
pub mod osimage;
pub mod pending;
pub mod resolver;
pub mod update;
pub mod validate;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Path for systemd modifiable units, services, etc.
pub const PATH_SYSTEMD: &str = "/etc/systemd/system";

/// Path where enabled units are linked
pub const PATH_SYSTEMD_WANTS: &str = "/etc/systemd/system/multi-user.target.wants";

/// Symlink target for masked units
pub const PATH_DEV_NULL: &str = "/dev/null";

/// Transient state persisted across a config change + reboot
pub const PATH_STATE_JSON: &str = "/etc/machine-config-daemon/state.json";

/// Sentinel laid down by the provisioning stack; its presence marks bootstrap mode
pub const PATH_INITIAL_ANNOTATIONS: &str = "/etc/machine-config-daemon/node-annotations.json";

/// Kernel-generated identifier unique per boot
pub const PATH_BOOT_ID: &str = "/proc/sys/kernel/random/boot_id";

/// Mode applied to declared files and unit fragments when none is specified
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Join an absolute config-declared path onto a filesystem root.
///
/// Production runs with root `/`; tests point this at a temp dir.
pub fn rooted(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_strips_leading_slash() {
        assert_eq!(
            rooted(Path::new("/tmp/x"), "/etc/foo"),
            PathBuf::from("/tmp/x/etc/foo")
        );
    }

    #[test]
    fn test_rooted_at_real_root() {
        assert_eq!(rooted(Path::new("/"), "/etc/foo"), PathBuf::from("/etc/foo"));
    }
}
