//! Error types for the machined daemon

use thiserror::Error;

/// Main error type for daemon operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Node object is missing required data (annotations, name)
    #[error("node error: {0}")]
    Node(String),

    /// A referenced MachineConfig could not be resolved
    #[error("config error: {0}")]
    Config(String),

    /// Host-level failure: subprocess, mount, transient I/O
    #[error("host error: {0}")]
    Host(String),

    /// On-disk state diverges from what the config specifies
    #[error("on-disk state validation failed: {0}")]
    Drift(String),

    /// The pending-state file carries the current boot's ID: the reboot
    /// never happened, and retrying would loop. Fatal to the process.
    #[error("pending config {config} bootID {boot_id} matches current; failed to reboot?")]
    RebootLoop {
        /// Name of the config that was pending
        config: String,
        /// The boot ID shared by the record and the running kernel
        boot_id: String,
    },

    /// Config content the daemon cannot act on (unparseable image
    /// reference, undecipherable once-from payload)
    #[error("unsupported config: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create a node error with the given message
    pub fn node(msg: impl Into<String>) -> Self {
        Self::Node(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a host error with the given message
    pub fn host(msg: impl Into<String>) -> Self {
        Self::Host(msg.into())
    }

    /// Create a drift error with the given message
    pub fn drift(msg: impl Into<String>) -> Self {
        Self::Drift(msg.into())
    }

    /// Create an unsupported-config error with the given message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// True for the reboot-loop guard, which must terminate the process
    /// rather than degrade the node.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RebootLoop { .. })
    }
}
