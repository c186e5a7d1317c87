//! Remediation command execution.
//!
//! Commands are opaque shell lines configured by the operator. Output is
//! discarded; the only signal is the exit code.

use std::process::{Command, Stdio};
use tracing::warn;

/// Runs a shell command with stdio discarded. Returns true iff the command
/// ran and exited zero; spawn failures count as failure.
pub fn exec_command(command: &str) -> bool {
    if command.trim().is_empty() {
        warn!("refusing to execute empty command");
        return false;
    }

    match Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(err) => {
            warn!(command = %command, error = %err, "failed to execute command");
            false
        }
    }
}
