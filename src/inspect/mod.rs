//! Remote certificate inspection.
//!
//! [`RemoteCertInspector`] turns a domain name into a
//! [`CertificateRecord`] by fetching the leaf certificate the host presents
//! on port 443. Fetching is delegated to a [`CertificateProbe`] so the
//! network layer can be replaced in tests; [`NativeTlsProbe`] is the
//! production implementation.

pub mod probe;

pub use probe::NativeTlsProbe;

use crate::certificate::{CertificateDetails, CertificateError};
use crate::core::{CertSource, CertificateProbe, CertificateRecord};
use crate::limiter::ConcurrencyLimiter;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InspectError {
    #[error("connection to {0} failed: {1}")]
    Connect(String, String),

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: &'static str, seconds: u64 },

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("server presented no certificate")]
    NoPeerCertificate,

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Checks certificates served by remote hosts.
pub struct RemoteCertInspector {
    probe: Arc<dyn CertificateProbe>,
    limiter: Arc<ConcurrencyLimiter>,
}

impl RemoteCertInspector {
    pub fn new(probe: Arc<dyn CertificateProbe>, limiter: Arc<ConcurrencyLimiter>) -> Self {
        Self { probe, limiter }
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Inspects one domain. Never fails: any connect, handshake or parse
    /// problem becomes an error record.
    pub async fn inspect(&self, domain: &str, timeout: Duration) -> CertificateRecord {
        let result = match self.probe.fetch_leaf_certificate(domain, timeout).await {
            Ok(der) => CertificateDetails::from_der(&der).map_err(InspectError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(details) => {
                let attrs = details.attributes(Utc::now());
                debug!(domain = %domain, days = attrs.expire_in_days, "Remote certificate checked");
                CertificateRecord::success(domain, CertSource::Remote, attrs)
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "Remote certificate check failed");
                CertificateRecord::failure(domain, CertSource::Remote, e.to_string())
            }
        }
    }

    /// Inspects every domain concurrently, bounded by the limiter. The
    /// result holds exactly one record per domain, in input order.
    pub async fn check_all(self: &Arc<Self>, domains: &[String], timeout: Duration) -> Vec<CertificateRecord> {
        let handles: Vec<_> = domains
            .iter()
            .map(|domain| {
                let inspector = Arc::clone(self);
                let domain = domain.clone();
                tokio::spawn(async move {
                    let _permit = inspector.limiter.acquire().await;
                    inspector.inspect(&domain, timeout).await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(domains)
            .map(|(joined, domain)| match joined {
                Ok(record) => record,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Remote check task did not complete");
                    CertificateRecord::failure(domain.as_str(), CertSource::Remote, format!("check task failed: {}", e))
                }
            })
            .collect()
    }
}
