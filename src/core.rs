//! Core domain types and service traits for CertWarden
//!
//! This module defines the fundamental data structures and trait contracts
//! that govern component interactions throughout the application.

use crate::config::{LogLevel, MonitoringConfig};
use crate::inspect::InspectError;
use crate::watcher::FetchError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Where a monitored certificate was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertSource {
    /// Served by a remote host on port 443.
    Remote,
    /// Stored in the local certificate directory.
    Local,
}

impl CertSource {
    /// The value used for the `source` metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            CertSource::Remote => "remote",
            CertSource::Local => "local",
        }
    }
}

impl std::fmt::Display for CertSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single check. A record carries either the remaining
/// lifetime or an error message, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CheckStatus {
    Ok { expire_in_days: i64 },
    Error { message: String },
}

/// The unit of observation produced by both inspectors.
///
/// Records are immutable once built; a new check cycle produces a new set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateRecord {
    identity: String,
    source: CertSource,
    #[serde(flatten)]
    status: CheckStatus,
    is_wildcard: bool,
    subject_alternative_names: Vec<String>,
    issuer: String,
    subject: String,
    valid_from: Option<DateTime<Utc>>,
    valid_to: Option<DateTime<Utc>>,
    has_private_key_adjacent: bool,
}

/// Certificate attributes shared by every successful record.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateAttributes {
    pub expire_in_days: i64,
    pub is_wildcard: bool,
    pub subject_alternative_names: Vec<String>,
    pub issuer: String,
    pub subject: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

impl CertificateRecord {
    /// Builds a successful record from extracted certificate attributes.
    pub fn success(identity: impl Into<String>, source: CertSource, attrs: CertificateAttributes) -> Self {
        Self {
            identity: identity.into(),
            source,
            status: CheckStatus::Ok {
                expire_in_days: attrs.expire_in_days,
            },
            is_wildcard: attrs.is_wildcard,
            subject_alternative_names: attrs.subject_alternative_names,
            issuer: attrs.issuer,
            subject: attrs.subject,
            valid_from: Some(attrs.valid_from),
            valid_to: Some(attrs.valid_to),
            has_private_key_adjacent: false,
        }
    }

    /// Builds a failed record carrying only the identity and the error message.
    pub fn failure(identity: impl Into<String>, source: CertSource, message: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            source,
            status: CheckStatus::Error {
                message: message.into(),
            },
            is_wildcard: false,
            subject_alternative_names: Vec::new(),
            issuer: String::new(),
            subject: String::new(),
            valid_from: None,
            valid_to: None,
            has_private_key_adjacent: false,
        }
    }

    /// Marks whether a sibling private-key file was found. Only meaningful
    /// for local records; consumes the record so construction stays one-shot.
    pub fn with_private_key_adjacent(mut self, present: bool) -> Self {
        self.has_private_key_adjacent = present;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn source(&self) -> CertSource {
        self.source
    }

    pub fn status(&self) -> &CheckStatus {
        &self.status
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, CheckStatus::Ok { .. })
    }

    /// Days until expiry, present only for successful records.
    pub fn expire_in_days(&self) -> Option<i64> {
        match self.status {
            CheckStatus::Ok { expire_in_days } => Some(expire_in_days),
            CheckStatus::Error { .. } => None,
        }
    }

    /// The failure message, present only for failed records.
    pub fn error(&self) -> Option<&str> {
        match &self.status {
            CheckStatus::Ok { .. } => None,
            CheckStatus::Error { message } => Some(message),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }

    pub fn subject_alternative_names(&self) -> &[String] {
        &self.subject_alternative_names
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn valid_from(&self) -> Option<DateTime<Utc>> {
        self.valid_from
    }

    pub fn valid_to(&self) -> Option<DateTime<Utc>> {
        self.valid_to
    }

    pub fn has_private_key_adjacent(&self) -> bool {
        self.has_private_key_adjacent
    }
}

/// Counts and timing for one check cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub total_remote: usize,
    pub successful_remote: usize,
    pub total_local: usize,
    pub successful_local: usize,
    /// Successful records at or below the configured `threshold_days`.
    pub expiring: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_duration_secs")]
    pub duration: Duration,
}

fn serialize_duration_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Aggregate of one coordinator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckCycleResult {
    pub remote: Vec<CertificateRecord>,
    pub local: Vec<CertificateRecord>,
    pub summary: CycleSummary,
    /// Set when the cycle itself faulted; per-record failures live in the records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckCycleResult {
    /// Iterates over all records, remote first.
    pub fn records(&self) -> impl Iterator<Item = &CertificateRecord> {
        self.remote.iter().chain(self.local.iter())
    }

    /// Total number of records across both sources.
    pub fn total(&self) -> usize {
        self.remote.len() + self.local.len()
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Receives per-certificate attribute updates.
pub trait MetricsSink: Send + Sync {
    fn set_validity(&self, identity: &str, source: CertSource, valid: bool);
    fn set_expire_days(&self, identity: &str, source: CertSource, days: i64);
    fn set_wildcard(&self, identity: &str, source: CertSource, wildcard: bool);
    fn set_san_count(&self, identity: &str, source: CertSource, count: usize);
    /// Drops every series published for the pair. Called once a pair is
    /// no longer monitored.
    fn remove(&self, identity: &str, source: CertSource);
}

/// Requests an in-place restart of the serving process.
#[async_trait]
pub trait ProcessController: Send + Sync {
    /// Returns whether the restart request was dispatched.
    async fn request_graceful_restart(&self) -> bool;
}

/// Fetches the leaf certificate a remote host presents.
#[async_trait]
pub trait CertificateProbe: Send + Sync {
    /// Connects to `domain`, completes a TLS handshake with `domain` as the
    /// expected server name and returns the peer's leaf certificate (DER).
    ///
    /// # Arguments
    /// * `domain` - The host to connect to
    /// * `timeout` - Upper bound for the connect and for the handshake
    async fn fetch_leaf_certificate(&self, domain: &str, timeout: Duration) -> Result<Vec<u8>, InspectError>;
}

/// Retrieves the raw remote configuration document.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<String, FetchError>;
}

/// Observer notified after a new configuration has been applied.
///
/// Implementations must return quickly; long-running work should be handed
/// off to another task.
pub trait ConfigSubscriber: Send + Sync {
    fn on_config_change(&self, config: Arc<MonitoringConfig>);
}

/// A log output whose level can be changed at runtime.
pub trait LogLevelSink: Send + Sync {
    fn set_level(&self, level: LogLevel) -> anyhow::Result<()>;
}
