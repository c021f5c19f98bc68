//! Login-session auditing from the systemd journal.
//!
//! Interactive logins on a managed node are discouraged: any change made
//! by hand will be flagged as drift on the next boot. The auditor scans
//! the current boot's journal for session starts at startup, then tails
//! the journal for new ones, annotating the node each time.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Error;
use crate::exec::CommandRunner;
use crate::node::NodeWriter;

/// systemd's message ID for session starts, from sd-messages.h.
pub const SESSION_START_MESSAGE_ID: &str = "8d45620c1a4348dbb17410da57c60c66";

/// Scan the current boot's journal for logins that predate the daemon.
///
/// A positive signal annotates the node but is not an error.
pub async fn detect_boot_ssh_accesses(
    runner: &dyn CommandRunner,
    writer: &dyn NodeWriter,
    node: &str,
) -> Result<(), Error> {
    let filter = format!("MESSAGE_ID={SESSION_START_MESSAGE_ID}");
    let out = runner
        .run(
            "journalctl",
            &["-b".into(), "-o".into(), "cat".into(), filter],
        )?
        .require_success("journalctl boot scan")?;

    if !out.stdout.trim().is_empty() {
        info!("detected a login session before the daemon took over");
        writer.set_ssh_accessed(node).await?;
    }
    Ok(())
}

/// Tail the journal for new session starts until cancelled.
///
/// Annotation failures and tail failures are reported on `err_tx`, not
/// fatal. The journalctl child never outlives the cancellation token.
pub async fn run_login_monitor(
    node: String,
    writer: Arc<dyn NodeWriter>,
    cancel: CancellationToken,
    err_tx: mpsc::UnboundedSender<Error>,
) {
    let filter = format!("MESSAGE_ID={SESSION_START_MESSAGE_ID}");
    let mut child = match tokio::process::Command::new("journalctl")
        .args(["-b", "-f", "-o", "cat", &filter])
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let _ = err_tx.send(Error::host(format!("spawning journal tail: {e}")));
            return;
        }
    };
    let Some(stdout) = child.stdout.take() else {
        let _ = err_tx.send(Error::host("journal tail has no stdout"));
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("stopping journal tail");
                let _ = child.kill().await;
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    info!(%line, "detected a new login session");
                    if let Err(e) = writer.set_ssh_accessed(&node).await {
                        let _ = err_tx.send(e);
                    }
                }
                Ok(None) => {
                    let _ = err_tx.send(Error::host("journal tail exited"));
                    return;
                }
                Err(e) => {
                    let _ = err_tx.send(Error::Io(e));
                    return;
                }
            }
        }
    }
}
