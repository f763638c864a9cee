//! # System Metrics Collector
//!
//! Periodically samples this process's CPU and resident memory via
//! `sysinfo` and publishes them as gauges.

use log::error;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tokio::time;
use tracing::trace;

const SYSTEM_METRICS_COLLECTION_INTERVAL: Duration = Duration::from_secs(10);

pub struct SystemCollector {
    system: System,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Runs the collection loop until shutdown or until the process can no
    /// longer be found.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = time::interval(SYSTEM_METRICS_COLLECTION_INTERVAL);
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to get current PID: {}", e);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    trace!("System collector received shutdown signal.");
                    break;
                }
                _ = interval.tick() => {}
            }

            if !self.system.refresh_process(pid) {
                error!(
                    "SystemCollector: process with PID {} no longer found. Collector is shutting down.",
                    pid
                );
                break;
            }
            if let Some(process) = self.system.process(pid) {
                metrics::gauge!("process_cpu_usage_percent").set(process.cpu_usage() as f64);
                metrics::gauge!("process_memory_usage_bytes").set(process.memory() as f64);
            }
        }
    }
}
