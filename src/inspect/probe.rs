//! Fetches leaf certificates over a real TLS handshake.

use super::InspectError;
use crate::core::CertificateProbe;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

pub const HTTPS_PORT: u16 = 443;

/// Platform-TLS probe. The handshake verifies the chain and the hostname the
/// same way an ordinary client would; an untrusted or expired certificate is
/// therefore reported as a handshake failure.
#[derive(Debug, Clone)]
pub struct NativeTlsProbe {
    port: u16,
}

impl Default for NativeTlsProbe {
    fn default() -> Self {
        Self { port: HTTPS_PORT }
    }
}

impl NativeTlsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes a port other than 443.
    pub fn with_port(port: u16) -> Self {
        Self { port }
    }
}

#[async_trait]
impl CertificateProbe for NativeTlsProbe {
    async fn fetch_leaf_certificate(&self, domain: &str, limit: Duration) -> Result<Vec<u8>, InspectError> {
        let seconds = limit.as_secs();

        let tcp = timeout(limit, TcpStream::connect((domain, self.port)))
            .await
            .map_err(|_| InspectError::Timeout { stage: "TCP connect", seconds })?
            .map_err(|e| InspectError::Connect(format!("{}:{}", domain, self.port), e.to_string()))?;
        trace!(domain, port = self.port, "TCP connection established");

        let connector = native_tls::TlsConnector::new()
            .map_err(|e| InspectError::Handshake(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let mut tls = timeout(limit, connector.connect(domain, tcp))
            .await
            .map_err(|_| InspectError::Timeout { stage: "TLS handshake", seconds })?
            .map_err(|e| InspectError::Handshake(e.to_string()))?;

        let der = tls
            .get_ref()
            .peer_certificate()
            .map_err(|e| InspectError::Handshake(e.to_string()))?
            .ok_or(InspectError::NoPeerCertificate)?
            .to_der()
            .map_err(|e| InspectError::Handshake(e.to_string()))?;

        // Best effort close_notify; the socket is dropped either way.
        if let Err(e) = timeout(limit, tls.shutdown()).await.unwrap_or(Ok(())) {
            trace!(domain, error = %e, "TLS shutdown did not complete cleanly");
        }

        Ok(der)
    }
}
