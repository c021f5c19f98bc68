//! MachineConfig Custom Resource Definition
//!
//! A MachineConfig is a named, immutable bundle of {OS image URL, files,
//! systemd units, SSH keys} describing a target machine state. Two configs
//! are "the same config" only when their names are equal; a rendering
//! controller owns naming and versioning.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a MachineConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "machined.dev",
    version = "v1",
    kind = "MachineConfig",
    plural = "machineconfigs",
    shortname = "mc",
    printcolumn = r#"{"name":"OSImage","type":"string","jsonPath":".spec.osImageURL"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfigSpec {
    /// Target OS image reference. Empty means "leave the booted OS alone".
    #[serde(default, rename = "osImageURL")]
    pub os_image_url: String,

    /// Files to lay down, in order. When the same path appears more than
    /// once, the last occurrence wins.
    #[serde(default)]
    pub files: Vec<FileSpec>,

    /// Systemd units to write, mask, or enable.
    #[serde(default)]
    pub units: Vec<SystemdUnit>,

    /// Users whose SSH authorized keys are managed. Only the first user
    /// carrying keys is handled today.
    #[serde(default)]
    pub ssh_users: Vec<PasswdUser>,
}

/// A file declared by a MachineConfig.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Absolute path on the node
    pub path: String,

    /// Contents as an RFC 2397 data URL
    #[serde(default)]
    pub contents: String,

    /// Permission bits; 0644 when unspecified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// A systemd unit declared by a MachineConfig.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemdUnit {
    /// Unit file name, e.g. `kubelet.service`
    pub name: String,

    /// Unit file body; empty means the unit body is not managed
    #[serde(default)]
    pub contents: String,

    /// Replace the unit path with a symlink to /dev/null
    #[serde(default)]
    pub mask: bool,

    /// Link the unit into the multi-user wants directory
    #[serde(default)]
    pub enabled: bool,

    /// Drop-in fragments applied under `<name>.d/`
    #[serde(default)]
    pub dropins: Vec<Dropin>,
}

/// A drop-in fragment for a systemd unit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dropin {
    /// Fragment file name, e.g. `10-proxy.conf`
    pub name: String,

    /// Fragment contents (plain text, not data-URL encoded)
    #[serde(default)]
    pub contents: String,
}

/// A passwd user with managed SSH keys.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PasswdUser {
    /// Login name
    pub name: String,

    /// Full declared set of authorized public keys
    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults_from_minimal_yaml() {
        let spec: MachineConfigSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec, MachineConfigSpec::default());
        assert!(spec.os_image_url.is_empty());
        assert!(spec.files.is_empty());
    }

    #[test]
    fn test_spec_parses_camel_case() {
        let yaml = r#"
osImageURL: "registry.example.com/os@sha256:abc"
files:
  - path: /etc/foo
    contents: "data:,hello"
    mode: 384
units:
  - name: kubelet.service
    enabled: true
    dropins:
      - name: 10-extra.conf
        contents: "[Service]\n"
sshUsers:
  - name: core
    sshAuthorizedKeys: ["ssh-ed25519 AAAA..."]
"#;
        let spec: MachineConfigSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.os_image_url, "registry.example.com/os@sha256:abc");
        assert_eq!(spec.files[0].mode, Some(0o600));
        assert!(spec.units[0].enabled);
        assert!(!spec.units[0].mask);
        assert_eq!(spec.units[0].dropins[0].name, "10-extra.conf");
        assert_eq!(spec.ssh_users[0].name, "core");
    }

    #[test]
    fn test_same_config_means_same_name() {
        let a = MachineConfig::new("rendered-1", MachineConfigSpec::default());
        let b = MachineConfig::new("rendered-1", MachineConfigSpec::default());
        assert_eq!(a.metadata.name, b.metadata.name);
    }
}
