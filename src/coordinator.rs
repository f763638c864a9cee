//! Orchestrates one full check cycle.
//!
//! A cycle reads one configuration snapshot, runs the remote inspector and
//! the local scanner side by side, waits for both, summarises the outcome
//! and publishes per-certificate metrics. It never writes configuration.

use crate::config::{ConfigHandle, MonitoringConfig};
use crate::core::{CertSource, CertificateRecord, CheckCycleResult, CycleSummary, MetricsSink};
use crate::inspect::RemoteCertInspector;
use crate::scanner::{resolve_cert_directory, LocalCertScanner};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};

/// Candidate locations of the local certificate directory.
#[derive(Debug, Clone)]
pub struct CertDirectories {
    pub container_dir: PathBuf,
    pub fallback_dir: PathBuf,
}

impl CertDirectories {
    pub fn resolve(&self) -> Option<PathBuf> {
        resolve_cert_directory(&self.container_dir, &self.fallback_dir)
    }
}

pub struct CheckCoordinator {
    config: ConfigHandle,
    inspector: Arc<RemoteCertInspector>,
    scanner: Arc<LocalCertScanner>,
    sink: Arc<dyn MetricsSink>,
    cert_dirs: Option<CertDirectories>,
    published: Mutex<HashSet<(String, CertSource)>>,
}

/// Waits for both sub-scans. A task that panicked or was cancelled yields no
/// records and a fault message naming its source; the other side's records
/// are kept.
pub async fn join_scans(
    remote: JoinHandle<Vec<CertificateRecord>>,
    local: JoinHandle<Vec<CertificateRecord>>,
) -> (Vec<CertificateRecord>, Vec<CertificateRecord>, Option<String>) {
    let (remote, local) = tokio::join!(remote, local);

    let mut faults = Vec::new();
    let mut records = |joined: Result<Vec<CertificateRecord>, JoinError>, source: CertSource| {
        joined.unwrap_or_else(|e| {
            faults.push(format!("{} scan failed: {}", source, e));
            Vec::new()
        })
    };
    let remote = records(remote, CertSource::Remote);
    let local = records(local, CertSource::Local);
    let error = (!faults.is_empty()).then(|| faults.join("; "));
    (remote, local, error)
}

impl CheckCoordinator {
    /// Creates a coordinator. With `cert_dirs` set to `None` local scanning
    /// is disabled and every cycle reports zero local records.
    pub fn new(
        config: ConfigHandle,
        inspector: Arc<RemoteCertInspector>,
        scanner: Arc<LocalCertScanner>,
        sink: Arc<dyn MetricsSink>,
        cert_dirs: Option<CertDirectories>,
    ) -> Self {
        Self {
            config,
            inspector,
            scanner,
            sink,
            cert_dirs,
            published: Mutex::new(HashSet::new()),
        }
    }

    /// Runs one cycle to completion.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> CheckCycleResult {
        let config = self.config.snapshot();
        self.inspector.limiter().resize(config.max_concurrent_checks);
        self.scanner.limiter().resize(config.max_concurrent_checks);

        let timestamp = Utc::now();
        let started = Instant::now();
        info!(domains = config.domains.len(), "Starting certificate check cycle");

        let remote_task = {
            let inspector = Arc::clone(&self.inspector);
            let domains = config.domains.clone();
            let timeout = config.connect_timeout();
            tokio::spawn(async move { inspector.check_all(&domains, timeout).await })
        };
        let local_task = {
            let scanner = Arc::clone(&self.scanner);
            let directory = self.cert_dirs.as_ref().and_then(CertDirectories::resolve);
            tokio::spawn(async move { scanner.scan_all(directory.as_deref()).await })
        };
        let (remote, local, error) = join_scans(remote_task, local_task).await;
        if let Some(error) = &error {
            error!(%error, "Check cycle completed with a fault, results are partial");
        }

        let summary = CycleSummary {
            total_remote: remote.len(),
            successful_remote: remote.iter().filter(|r| r.is_ok()).count(),
            total_local: local.len(),
            successful_local: local.iter().filter(|r| r.is_ok()).count(),
            expiring: remote
                .iter()
                .chain(local.iter())
                .filter_map(CertificateRecord::expire_in_days)
                .filter(|days| *days <= config.threshold_days)
                .count(),
            timestamp,
            duration: started.elapsed(),
        };

        let result = CheckCycleResult {
            remote,
            local,
            summary,
            error,
        };
        self.publish(&result, &config);
        result
    }

    fn publish(&self, result: &CheckCycleResult, config: &MonitoringConfig) {
        for record in result.records() {
            let (identity, source) = (record.identity(), record.source());
            match record.expire_in_days() {
                Some(days) => {
                    self.sink.set_validity(identity, source, true);
                    self.sink.set_expire_days(identity, source, days);
                    self.sink.set_wildcard(identity, source, record.is_wildcard());
                    self.sink.set_san_count(identity, source, record.subject_alternative_names().len());
                    if days <= config.expire_warning_days {
                        warn!(%identity, %source, days, "Certificate expires soon");
                    }
                }
                None => self.sink.set_validity(identity, source, false),
            }
        }
        self.retire_vanished(result);

        let summary = &result.summary;
        metrics::histogram!("check_cycle_duration_seconds").record(summary.duration.as_secs_f64());
        for (source, total, ok) in [
            (CertSource::Remote, summary.total_remote, summary.successful_remote),
            (CertSource::Local, summary.total_local, summary.successful_local),
        ] {
            metrics::gauge!("check_cycle_certificates", "source" => source.as_str(), "outcome" => "ok").set(ok as f64);
            metrics::gauge!("check_cycle_certificates", "source" => source.as_str(), "outcome" => "error")
                .set((total - ok) as f64);
        }

        info!(
            remote = summary.total_remote,
            remote_ok = summary.successful_remote,
            local = summary.total_local,
            local_ok = summary.successful_local,
            expiring = summary.expiring,
            duration_ms = summary.duration.as_millis() as u64,
            "Check cycle finished"
        );
    }

    /// Removes the series of pairs earlier cycles published but this one did
    /// not report. A faulted cycle only adds pairs.
    fn retire_vanished(&self, result: &CheckCycleResult) {
        let current: HashSet<(String, CertSource)> = result
            .records()
            .map(|r| (r.identity().to_string(), r.source()))
            .collect();
        let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
        if result.error.is_some() {
            published.extend(current);
            return;
        }
        for (identity, source) in published.difference(&current) {
            debug!(%identity, %source, "Removing metrics for certificate no longer monitored");
            self.sink.remove(identity, *source);
        }
        *published = current;
    }
}
