//! Local certificate scanning.
//!
//! Enumerates the certificate files of one directory (non-recursively) and
//! produces a [`CertificateRecord`] per file, with the same derived
//! attributes as remote checks plus private-key adjacency.

use crate::certificate::{strip_wildcard, CertificateDetails, CertificateError};
use crate::core::{CertSource, CertificateRecord};
use crate::limiter::ConcurrencyLimiter;
use chrono::Utc;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("certificate file is not readable: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Picks the directory to scan: the container path when it is a directory,
/// otherwise the fallback. A relative fallback is resolved against the
/// directory holding the running executable. `None` when neither exists.
pub fn resolve_cert_directory(container_dir: &Path, fallback_dir: &Path) -> Option<PathBuf> {
    if container_dir.is_dir() {
        return Some(container_dir.to_path_buf());
    }

    let fallback = if fallback_dir.is_relative() {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(fallback_dir)))
            .unwrap_or_else(|| fallback_dir.to_path_buf())
    } else {
        fallback_dir.to_path_buf()
    };

    fallback.is_dir().then_some(fallback)
}

pub struct LocalCertScanner {
    limiter: Arc<ConcurrencyLimiter>,
    cert_extension: String,
    key_extension: String,
}

impl LocalCertScanner {
    pub fn new(limiter: Arc<ConcurrencyLimiter>, cert_extension: impl Into<String>, key_extension: impl Into<String>) -> Self {
        Self {
            limiter,
            cert_extension: cert_extension.into(),
            key_extension: key_extension.into(),
        }
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// Scans `directory`, one record per certificate file, sorted by file
    /// name. A missing directory yields no records; a bad file yields an
    /// error record without affecting the others.
    pub async fn scan_all(self: &Arc<Self>, directory: Option<&Path>) -> Vec<CertificateRecord> {
        let Some(directory) = directory else {
            debug!("No local certificate directory available, skipping local scan");
            return Vec::new();
        };

        let files = match self.list_certificate_files(directory).await {
            Ok(files) => files,
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "Cannot list local certificate directory");
                return Vec::new();
            }
        };
        info!(directory = %directory.display(), files = files.len(), "Scanning local certificates");

        let handles: Vec<_> = files
            .iter()
            .map(|path| {
                let scanner = Arc::clone(self);
                let path = path.clone();
                tokio::spawn(async move {
                    let _permit = scanner.limiter.acquire().await;
                    scanner.scan_file(&path).await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(&files)
            .map(|(joined, path)| match joined {
                Ok(record) => record,
                Err(e) => {
                    let identity = self.identity_for(path, None);
                    warn!(file = %path.display(), error = %e, "Local scan task did not complete");
                    CertificateRecord::failure(identity, CertSource::Local, format!("scan task failed: {}", e))
                }
            })
            .collect()
    }

    /// Parses a single certificate file.
    pub async fn scan_file(&self, path: &Path) -> CertificateRecord {
        let details = match self.read_details(path).await {
            Ok(details) => details,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Local certificate check failed");
                return CertificateRecord::failure(self.identity_for(path, None), CertSource::Local, e.to_string());
            }
        };

        let identity = self.identity_for(path, details.common_name());
        let key_path = path.with_extension(&self.key_extension);
        let has_key = tokio::fs::try_exists(&key_path).await.unwrap_or(false);
        let attrs = details.attributes(Utc::now());
        debug!(file = %path.display(), %identity, days = attrs.expire_in_days, has_key, "Local certificate checked");

        CertificateRecord::success(identity, CertSource::Local, attrs).with_private_key_adjacent(has_key)
    }

    async fn read_details(&self, path: &Path) -> Result<CertificateDetails, ScanError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(CertificateDetails::from_pem_or_der(&bytes)?)
    }

    /// The monitored name for a file: the file name without the exact
    /// certificate suffix; for files not carrying that suffix, the common
    /// name without a wildcard prefix; failing both, the bare file stem.
    fn identity_for(&self, path: &Path, common_name: Option<&str>) -> String {
        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let suffix = format!(".{}", self.cert_extension);

        if let Some(stripped) = file_name.strip_suffix(suffix.as_str()).filter(|s| !s.is_empty()) {
            return stripped.to_string();
        }
        if let Some(cn) = common_name.map(strip_wildcard).filter(|cn| !cn.is_empty()) {
            return cn.to_string();
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file_name)
            .to_string()
    }

    async fn list_certificate_files(&self, directory: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(directory).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches_extension = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.cert_extension));
            if matches_extension && entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
