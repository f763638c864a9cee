//! Signals the serving process to restart gracefully.
//!
//! The serving process records its pid in a file (the usual pre-fork server
//! layout). A restart request reads that pid and sends the configured signal
//! with `kill`; for pre-fork servers `HUP` replaces the workers while the
//! master keeps its listening sockets.

use crate::core::ProcessController;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{error, info};
use std::path::{Path, PathBuf};
use tokio::process::Command as AsyncCommand;

#[derive(Debug, Clone)]
pub struct PidFileController {
    pid_file: PathBuf,
    signal: String,
}

impl PidFileController {
    pub fn new(pid_file: impl Into<PathBuf>, signal: impl Into<String>) -> Self {
        Self {
            pid_file: pid_file.into(),
            signal: signal.into(),
        }
    }

    async fn send_signal(&self) -> Result<u32> {
        let pid = read_pid(&self.pid_file).await?;

        let output = AsyncCommand::new("kill")
            .arg("-s")
            .arg(&self.signal)
            .arg(pid.to_string())
            .output()
            .await
            .context("failed to run kill")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("kill -s {} {} failed: {}", self.signal, pid, stderr.trim()));
        }
        Ok(pid)
    }
}

/// Reads a pid file containing a single positive integer.
pub async fn read_pid(path: &Path) -> Result<u32> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read pid file {}", path.display()))?;
    let pid: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("pid file {} does not hold a pid", path.display()))?;
    if pid == 0 {
        return Err(anyhow!("pid file {} holds pid 0", path.display()));
    }
    Ok(pid)
}

#[async_trait]
impl ProcessController for PidFileController {
    async fn request_graceful_restart(&self) -> bool {
        match self.send_signal().await {
            Ok(pid) => {
                info!("Sent SIG{} to serving process {}", self.signal, pid);
                true
            }
            Err(e) => {
                error!("Graceful restart request failed: {:#}", e);
                false
            }
        }
    }
}

/// Controller used when restarts are disabled; logs and declines.
#[derive(Debug, Default, Clone)]
pub struct DisabledController;

#[async_trait]
impl ProcessController for DisabledController {
    async fn request_graceful_restart(&self) -> bool {
        info!("Restart requested but process restarts are disabled");
        false
    }
}
