//! # Internal Metrics Module
//!
//! Installs the Prometheus recorder and exposes the certificate gauges.
//!
//! ## Components:
//!
//! - **`MetricsBuilder`**: Sets up the Prometheus recorder, binds the
//!   listener and hands back a `MetricsServer` ready to be spawned.
//!
//! - **`PrometheusSink`**: The [`MetricsSink`] the check coordinator
//!   publishes per-certificate values through.
//!
//! - **`MetricsServer`**: (Defined in `server.rs`) An `axum`-based web server
//!   that exposes `/metrics` and `/health`.
//!
//! - **`SystemCollector`**: (Defined in `system.rs`) A background task that
//!   periodically collects process CPU and memory usage.

use crate::core::{CertSource, MetricsSink};
use crate::internal_metrics::server::MetricsServer;
use log::error;
use metrics::Unit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusRecorder};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;

pub mod server;
pub mod system;

/// Registers descriptions for the process-wide metrics. The certificate
/// gauges are described by [`PrometheusSink`] on its own recorder.
pub fn describe_metrics() {
    metrics::describe_histogram!("check_cycle_duration_seconds", Unit::Seconds, "Wall-clock duration of a full check cycle.");
    metrics::describe_gauge!("check_cycle_certificates", Unit::Count, "Records produced by the last cycle, by source and outcome.");
    metrics::describe_counter!("config_reloads_total", Unit::Count, "Remote configuration documents applied.");
    metrics::describe_counter!("config_poll_failures_total", Unit::Count, "Remote configuration polls that failed or were rejected.");
    metrics::describe_counter!("restart_requests_total", Unit::Count, "Graceful restart requests, labeled by reason.");
    metrics::describe_gauge!("process_cpu_usage_percent", Unit::Percent, "The percentage of CPU time the `certwarden` process is currently using.");
    metrics::describe_gauge!("process_memory_usage_bytes", Unit::Bytes, "The amount of physical memory (resident set size) the `certwarden` process is using, in bytes.");
}

fn describe_certificate_metrics() {
    metrics::describe_gauge!("ssl_cert_valid", Unit::Count, "1 if the certificate could be checked successfully, 0 otherwise.");
    metrics::describe_gauge!("ssl_cert_expire_days", Unit::Count, "Whole days until the certificate expires; negative once expired.");
    metrics::describe_gauge!("ssl_cert_is_wildcard", Unit::Count, "1 if the certificate covers a wildcard name.");
    metrics::describe_gauge!("ssl_cert_san_count", Unit::Count, "Number of DNS subject alternative names on the certificate.");
}

/// Last values published for one `(domain, source)` pair.
#[derive(Debug, Default, Clone, Copy)]
struct CertGauges {
    valid: Option<f64>,
    expire_days: Option<f64>,
    wildcard: Option<f64>,
    san_count: Option<f64>,
}

impl CertGauges {
    fn apply(&self, identity: &str, source: CertSource) {
        let labels = [("domain", identity.to_string()), ("source", source.as_str().to_string())];
        if let Some(v) = self.valid {
            metrics::gauge!("ssl_cert_valid", &labels).set(v);
        }
        if let Some(v) = self.expire_days {
            metrics::gauge!("ssl_cert_expire_days", &labels).set(v);
        }
        if let Some(v) = self.wildcard {
            metrics::gauge!("ssl_cert_is_wildcard", &labels).set(v);
        }
        if let Some(v) = self.san_count {
            metrics::gauge!("ssl_cert_san_count", &labels).set(v);
        }
    }
}

struct CertSeries {
    values: HashMap<(String, CertSource), CertGauges>,
    recorder: PrometheusRecorder,
}

fn certificate_recorder() -> PrometheusRecorder {
    let recorder = PrometheusBuilder::new().build_recorder();
    metrics::with_local_recorder(&recorder, describe_certificate_metrics);
    recorder
}

/// Publishes the `ssl_cert_*` gauges, labeled by `domain` and `source`.
///
/// The `metrics` facade cannot unregister a series, so these gauges live on
/// a recorder owned by the sink. Removing a pair rebuilds that recorder from
/// the remaining values; the metrics server appends [`PrometheusSink::render`]
/// to the global exposition.
#[derive(Clone)]
pub struct PrometheusSink {
    series: Arc<Mutex<CertSeries>>,
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            series: Arc::new(Mutex::new(CertSeries {
                values: HashMap::new(),
                recorder: certificate_recorder(),
            })),
        }
    }

    /// Renders the certificate gauges in the Prometheus text format.
    pub fn render(&self) -> String {
        self.lock().recorder.handle().render()
    }

    fn lock(&self) -> MutexGuard<'_, CertSeries> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, identity: &str, source: CertSource, f: impl FnOnce(&mut CertGauges)) {
        let mut series = self.lock();
        let CertSeries { values, recorder } = &mut *series;
        let gauges = values.entry((identity.to_string(), source)).or_default();
        f(gauges);
        metrics::with_local_recorder(&*recorder, || gauges.apply(identity, source));
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

impl MetricsSink for PrometheusSink {
    fn set_validity(&self, identity: &str, source: CertSource, valid: bool) {
        self.update(identity, source, |g| g.valid = Some(flag(valid)));
    }

    fn set_expire_days(&self, identity: &str, source: CertSource, days: i64) {
        self.update(identity, source, |g| g.expire_days = Some(days as f64));
    }

    fn set_wildcard(&self, identity: &str, source: CertSource, wildcard: bool) {
        self.update(identity, source, |g| g.wildcard = Some(flag(wildcard)));
    }

    fn set_san_count(&self, identity: &str, source: CertSource, count: usize) {
        self.update(identity, source, |g| g.san_count = Some(count as f64));
    }

    fn remove(&self, identity: &str, source: CertSource) {
        let mut series = self.lock();
        if series.values.remove(&(identity.to_string(), source)).is_none() {
            return;
        }
        let recorder = certificate_recorder();
        metrics::with_local_recorder(&recorder, || {
            for ((identity, source), gauges) in &series.values {
                gauges.apply(identity, *source);
            }
        });
        series.recorder = recorder;
    }
}

/// Builder for the metrics system.
///
/// Initializes the `PrometheusRecorder` and prepares the `MetricsServer`.
pub struct MetricsBuilder {
    port: u16,
}

impl MetricsBuilder {
    /// Creates a builder serving on `0.0.0.0:port`.
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Installs the recorder and binds the listener. The server renders the
    /// global recorder followed by `certificates`.
    ///
    /// Failures are logged and yield `None`: the monitor keeps running
    /// without an exporter rather than refusing to start.
    pub fn build(
        self,
        certificates: PrometheusSink,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<(MetricsServer, SocketAddr)> {
        let recorder = match PrometheusBuilder::new().set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
        ) {
            Ok(builder) => builder.build_recorder(),
            Err(e) => {
                error!("Failed to configure Prometheus recorder: {}", e);
                return None;
            }
        };
        let handle = recorder.handle();

        // Bind before installing the recorder so a busy port leaves no
        // half-initialised global state behind.
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = match std::net::TcpListener::bind(bind_addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind metrics server to {}: {}", bind_addr, e);
                return None;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Failed to get local address for metrics server: {}", e);
                return None;
            }
        };
        let listener = match listener
            .set_nonblocking(true)
            .and_then(|_| TcpListener::from_std(listener))
        {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to hand metrics listener to the runtime: {}", e);
                return None;
            }
        };

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!("Failed to install Prometheus recorder: {}", e);
            return None;
        }
        describe_metrics();

        Some((MetricsServer::new(listener, handle, certificates, shutdown_rx), addr))
    }
}
