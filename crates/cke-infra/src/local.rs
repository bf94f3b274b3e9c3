use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use cke_core::Error;
use tokio::process::Command;
use tracing::debug;

/// Runs reboot, repair and health-check commands on the CKE host.
#[async_trait]
pub trait LocalRunner: Send + Sync {
    /// Run `argv` with `args` appended; returns trimmed stdout.
    async fn run(&self, argv: &[String], args: &[String], timeout: Duration) -> Result<String>;
}

/// [`LocalRunner`] spawning child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl LocalRunner for ProcessRunner {
    async fn run(&self, argv: &[String], args: &[String], timeout: Duration) -> Result<String> {
        let Some((program, rest)) = argv.split_first() else {
            bail!(Error::bad_request("empty command"));
        };
        debug!(command = ?argv, args = ?args, "running local command");
        let child = Command::new(program)
            .args(rest)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn {program}"))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::transient(format!("{program} timed out after {}s", timeout.as_secs())))?
            .with_context(|| format!("wait for {program}"))?;
        if !output.status.success() {
            return Err(Error::fatal(format!(
                "{program} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
