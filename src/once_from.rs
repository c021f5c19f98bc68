//! Loading a config for run-once-and-exit mode.
//!
//! The once-from source is either a local path or an `http(s)://` URL, and
//! its content is either an Ignition-shaped document or a MachineConfig
//! manifest. The loader senses which and returns a tagged sum; the daemon
//! dispatches on it exhaustively.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::crd::{Dropin, FileSpec, MachineConfig, PasswdUser, SystemdUnit};
use crate::error::Error;

/// The two shapes a once-from source can carry.
#[derive(Debug)]
pub enum OnceFromConfig {
    /// An Ignition-shaped document: files, units, users; no name, no OS image
    Ignition(IgnitionConfig),
    /// A full MachineConfig manifest
    MachineConfig(MachineConfig),
}

/// Where the once-from content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    /// Read from a local file; no cluster is assumed to exist
    Local,
    /// Fetched over HTTP; a cluster is expected to be reachable
    Remote,
}

/// The subset of Ignition the daemon provisions: files, units, SSH users.
#[derive(Debug, Default)]
pub struct IgnitionConfig {
    /// Files to lay down
    pub files: Vec<FileSpec>,
    /// Systemd units to write, mask, or enable
    pub units: Vec<SystemdUnit>,
    /// Users with declared SSH keys
    pub users: Vec<PasswdUser>,
}

// Wire mirror of the Ignition document, converted into crate types on load.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIgnition {
    #[serde(default)]
    ignition: RawIgnitionMeta,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    systemd: RawSystemd,
    #[serde(default)]
    passwd: RawPasswd,
}

#[derive(Deserialize, Default)]
struct RawIgnitionMeta {
    #[serde(default)]
    version: String,
}

#[derive(Deserialize, Default)]
struct RawStorage {
    #[serde(default)]
    files: Vec<RawFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFile {
    path: String,
    #[serde(default)]
    contents: RawFileContents,
    #[serde(default)]
    mode: Option<u32>,
}

#[derive(Deserialize, Default)]
struct RawFileContents {
    #[serde(default)]
    source: String,
}

#[derive(Deserialize, Default)]
struct RawSystemd {
    #[serde(default)]
    units: Vec<RawUnit>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUnit {
    name: String,
    #[serde(default)]
    contents: String,
    #[serde(default)]
    mask: bool,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    dropins: Vec<RawDropin>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDropin {
    name: String,
    #[serde(default)]
    contents: String,
}

#[derive(Deserialize, Default)]
struct RawPasswd {
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    name: String,
    #[serde(default)]
    ssh_authorized_keys: Vec<String>,
}

impl From<RawIgnition> for IgnitionConfig {
    fn from(raw: RawIgnition) -> Self {
        Self {
            files: raw
                .storage
                .files
                .into_iter()
                .map(|f| FileSpec {
                    path: f.path,
                    contents: f.contents.source,
                    mode: f.mode,
                })
                .collect(),
            units: raw
                .systemd
                .units
                .into_iter()
                .map(|u| SystemdUnit {
                    name: u.name,
                    contents: u.contents,
                    mask: u.mask,
                    enabled: u.enabled,
                    dropins: u
                        .dropins
                        .into_iter()
                        .map(|d| Dropin {
                            name: d.name,
                            contents: d.contents,
                        })
                        .collect(),
                })
                .collect(),
            users: raw
                .passwd
                .users
                .into_iter()
                .map(|u| PasswdUser {
                    name: u.name,
                    ssh_authorized_keys: u.ssh_authorized_keys,
                })
                .collect(),
        }
    }
}

/// A once-from source must be a URL or something that plausibly names a
/// local file. This does not check existence.
pub fn looks_like_path(candidate: &str) -> bool {
    candidate.starts_with('/') || candidate.starts_with('.')
}

/// Fetch the once-from content and sense its type.
pub async fn sense_and_load_once_from(
    source: &str,
) -> Result<(OnceFromConfig, ContentSource), Error> {
    let (content, origin) = if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source)
            .await
            .map_err(|e| Error::host(format!("fetching once-from config: {e}")))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::host(format!("reading once-from config: {e}")))?;
        (body.to_vec(), ContentSource::Remote)
    } else if looks_like_path(source) {
        let path = std::path::absolute(Path::new(source))
            .map_err(|e| Error::host(format!("resolving once-from path: {e}")))?;
        (std::fs::read(&path)?, ContentSource::Local)
    } else {
        return Err(Error::unsupported(format!(
            "{source} is not a path nor url; can not run once"
        )));
    };

    sense(&content, source).map(|config| (config, origin))
}

/// Try each supported parser in turn.
fn sense(content: &[u8], source: &str) -> Result<OnceFromConfig, Error> {
    if let Ok(raw) = serde_json::from_slice::<RawIgnition>(content) {
        if !raw.ignition.version.is_empty() {
            debug!(source, "once-from content is Ignition");
            return Ok(OnceFromConfig::Ignition(raw.into()));
        }
    }

    if let Ok(config) = serde_yaml::from_slice::<MachineConfig>(content) {
        debug!(source, "once-from content is a MachineConfig");
        return Ok(OnceFromConfig::MachineConfig(config));
    }

    Err(Error::unsupported(format!(
        "unable to decipher once-from config type from {source}"
    )))
}
