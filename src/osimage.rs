//! Booted OS image identity and the image-pivot backend seam.
//!
//! The daemon compares OS image references by canonical digest, never by
//! tag: two references naming the same digest are the same image even if
//! the registry paths differ cosmetically.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Error;
use crate::exec::CommandRunner;

/// The flavor of operating system the daemon manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OperatingSystem {
    /// Image-based OS whose root is pivoted wholesale between image digests
    ImageBased,
    /// Anything else; OS image checks and pivots are skipped
    Generic,
}

/// Legacy placeholder meaning "no OS image specified".
pub const LEGACY_PLACEHOLDER_URL: &str = "://dummy";

/// Extract the digest from a canonical (digested) image reference.
///
/// Fails unless the reference is in `name@algo:hex` form.
pub fn ref_digest(image_ref: &str) -> Result<String, Error> {
    let not_canonical =
        || Error::unsupported(format!("image reference not in canonical form: {image_ref:?}"));

    let (name, digest) = image_ref.rsplit_once('@').ok_or_else(not_canonical)?;
    if name.is_empty() {
        return Err(not_canonical());
    }
    let (algorithm, hex) = digest.split_once(':').ok_or_else(not_canonical)?;
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let hex_ok = hex.len() >= 32 && hex.bytes().all(|b| b.is_ascii_hexdigit());
    if !algorithm_ok || !hex_ok {
        return Err(not_canonical());
    }
    Ok(digest.to_string())
}

/// Decide whether the booted OS image satisfies the desired one.
///
/// An empty or legacy-placeholder target always passes. Otherwise compare
/// literally, then by canonical digest; a reference that fails to parse as
/// a digested form is an error.
pub fn compare_os_image_url(current: &str, desired: &str) -> Result<bool, Error> {
    if desired.is_empty() || desired == LEGACY_PLACEHOLDER_URL {
        info!("no target OS image URL provided");
        return Ok(true);
    }
    if current == desired {
        return Ok(true);
    }

    let booted = ref_digest(current)
        .map_err(|e| Error::unsupported(format!("parsing booted OS image URL: {e}")))?;
    let target = ref_digest(desired)
        .map_err(|e| Error::unsupported(format!("parsing desired OS image URL: {e}")))?;

    if booted == target {
        debug!(digest = %booted, "current and target OS image URLs share a digest");
        return Ok(true);
    }
    Ok(false)
}

/// Backend that deploys OS images on the host.
///
/// Opaque to the rest of the daemon; `stage_os_update` must be idempotent.
#[cfg_attr(test, mockall::automock)]
pub trait NodeUpdater: Send + Sync {
    /// The image URL and version the host is currently booted into.
    fn booted_os_image_url(&self, root: &Path) -> Result<(String, String), Error>;

    /// Human-readable deployment status, logged once per boot.
    fn status(&self) -> Result<String, Error>;

    /// Stage `desired_url` as the image for the next boot.
    fn stage_os_update(&self, desired_url: &str) -> Result<(), Error>;
}

/// Production backend driving an ostree-based deployment tool.
pub struct OstreeNodeUpdater {
    runner: Arc<dyn CommandRunner>,
}

impl OstreeNodeUpdater {
    /// Create a backend that shells out through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl NodeUpdater for OstreeNodeUpdater {
    fn booted_os_image_url(&self, _root: &Path) -> Result<(String, String), Error> {
        let out = self
            .runner
            .run("rpm-ostree", &["status".into(), "--json".into()])?
            .require_success("rpm-ostree status")?;
        parse_booted_deployment(&out.stdout)
    }

    fn status(&self) -> Result<String, Error> {
        let out = self
            .runner
            .run("rpm-ostree", &["status".into()])?
            .require_success("rpm-ostree status")?;
        Ok(out.stdout)
    }

    fn stage_os_update(&self, desired_url: &str) -> Result<(), Error> {
        self.runner
            .run(
                "rpm-ostree",
                &["rebase".into(), "--experimental".into(), desired_url.into()],
            )?
            .require_success("rpm-ostree rebase")?;
        Ok(())
    }
}

/// Pull the booted deployment's custom-origin URL and version out of the
/// deployment tool's JSON status.
fn parse_booted_deployment(status_json: &str) -> Result<(String, String), Error> {
    let status: serde_json::Value = serde_json::from_str(status_json)
        .map_err(|e| Error::host(format!("parsing deployment status: {e}")))?;

    let booted = status["deployments"]
        .as_array()
        .and_then(|ds| ds.iter().find(|d| d["booted"].as_bool() == Some(true)))
        .ok_or_else(|| Error::host("no booted deployment in status"))?;

    let url = booted["custom-origin"]
        .as_array()
        .and_then(|o| o.first())
        .and_then(|v| v.as_str())
        .map(|s| s.trim_start_matches("pivot://").to_string())
        .unwrap_or_default();
    let version = booted["version"].as_str().unwrap_or_default().to_string();

    Ok((url, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST_A: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const DIGEST_B: &str = "sha256:fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

    #[test]
    fn test_ref_digest_canonical() {
        let image = format!("registry.example.com/os/machine@{DIGEST_A}");
        assert_eq!(ref_digest(&image).unwrap(), DIGEST_A);
    }

    #[test]
    fn test_ref_digest_rejects_tag_reference() {
        assert!(ref_digest("registry.example.com/os/machine:latest").is_err());
        assert!(ref_digest("@sha256:abcd").is_err());
        assert!(ref_digest("registry.example.com/os@notadigest").is_err());
    }

    #[test]
    fn test_compare_skips_empty_and_legacy_target() {
        assert!(compare_os_image_url("anything", "").unwrap());
        assert!(compare_os_image_url("anything", LEGACY_PLACEHOLDER_URL).unwrap());
    }

    #[test]
    fn test_compare_literal_equality() {
        assert!(compare_os_image_url("a/b@c", "a/b@c").unwrap());
    }

    #[test]
    fn test_compare_by_digest() {
        let booted = format!("registry.example.com/os@{DIGEST_A}");
        let same_digest = format!("mirror.example.net/os@{DIGEST_A}");
        let other = format!("registry.example.com/os@{DIGEST_B}");
        assert!(compare_os_image_url(&booted, &same_digest).unwrap());
        assert!(!compare_os_image_url(&booted, &other).unwrap());
    }

    #[test]
    fn test_compare_unparseable_is_error() {
        let desired = format!("registry.example.com/os@{DIGEST_A}");
        assert!(compare_os_image_url("not-canonical", &desired).is_err());
    }

    #[test]
    fn test_parse_booted_deployment() {
        let json = format!(
            r#"{{"deployments": [
                {{"booted": false, "custom-origin": ["pivot://old@{DIGEST_B}"], "version": "48.1"}},
                {{"booted": true, "custom-origin": ["pivot://registry.example.com/os@{DIGEST_A}", "Managed machine image"], "version": "49.2"}}
            ]}}"#
        );
        let (url, version) = parse_booted_deployment(&json).unwrap();
        assert_eq!(url, format!("registry.example.com/os@{DIGEST_A}"));
        assert_eq!(version, "49.2");
    }

    #[test]
    fn test_parse_booted_deployment_missing() {
        assert!(parse_booted_deployment(r#"{"deployments": []}"#).is_err());
    }
}
