//! X.509 attribute extraction shared by the remote inspector and the local
//! scanner.
//!
//! Both sources end up with a DER-encoded leaf certificate; everything a
//! [`CertificateRecord`](crate::core::CertificateRecord) reports is derived
//! here so the two inspectors cannot drift apart.

use crate::core::CertificateAttributes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::Pem;

const SECONDS_PER_DAY: i64 = 86_400;
const WILDCARD_PREFIX: &str = "*.";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CertificateError {
    #[error("invalid PEM data: {0}")]
    Pem(String),
    #[error("no CERTIFICATE block found")]
    NoCertificateBlock,
    #[error("invalid X.509 certificate: {0}")]
    X509(String),
    #[error("certificate validity timestamp out of range")]
    Timestamp,
}

/// The attributes of a parsed certificate, detached from the DER buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateDetails {
    common_name: Option<String>,
    subject_alternative_names: Vec<String>,
    issuer: String,
    subject: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl CertificateDetails {
    /// Parses a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| CertificateError::X509(e.to_string()))?;
        Self::from_x509(&cert)
    }

    /// Parses the first `CERTIFICATE` block of a PEM buffer. Private keys or
    /// other blocks preceding it are skipped.
    pub fn from_pem(pem: &[u8]) -> Result<Self, CertificateError> {
        for block in Pem::iter_from_buffer(pem) {
            let block = block.map_err(|e| CertificateError::Pem(e.to_string()))?;
            if block.label == "CERTIFICATE" {
                return Self::from_der(&block.contents);
            }
        }
        Err(CertificateError::NoCertificateBlock)
    }

    /// Parses the contents of a certificate file: DER when the buffer opens
    /// with an ASN.1 SEQUENCE tag, PEM otherwise.
    pub fn from_pem_or_der(bytes: &[u8]) -> Result<Self, CertificateError> {
        match bytes.first() {
            Some(0x30) => Self::from_der(bytes),
            _ => Self::from_pem(bytes),
        }
    }

    fn from_x509(cert: &X509Certificate<'_>) -> Result<Self, CertificateError> {
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or(CertificateError::Timestamp)?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or(CertificateError::Timestamp)?;

        Ok(Self {
            common_name,
            subject_alternative_names: dns_names(cert)?,
            issuer: cert.issuer().to_string(),
            subject: cert.subject().to_string(),
            not_before,
            not_after,
        })
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn subject_alternative_names(&self) -> &[String] {
        &self.subject_alternative_names
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn expire_in_days(&self, now: DateTime<Utc>) -> i64 {
        expire_in_days(self.not_after, now)
    }

    pub fn is_wildcard(&self) -> bool {
        is_wildcard(self.common_name(), &self.subject_alternative_names)
    }

    /// Flattens the details into the record attributes, evaluated at `now`.
    pub fn attributes(&self, now: DateTime<Utc>) -> CertificateAttributes {
        CertificateAttributes {
            expire_in_days: self.expire_in_days(now),
            is_wildcard: self.is_wildcard(),
            subject_alternative_names: self.subject_alternative_names.clone(),
            issuer: self.issuer.clone(),
            subject: self.subject.clone(),
            valid_from: self.not_before,
            valid_to: self.not_after,
        }
    }
}

/// Whole days between `now` and `not_after`, rounded towards negative
/// infinity: one second past expiry is already day -1.
pub fn expire_in_days(not_after: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}

/// True if the common name or any SAN is a wildcard name.
pub fn is_wildcard(common_name: Option<&str>, sans: &[String]) -> bool {
    common_name.is_some_and(|cn| cn.starts_with(WILDCARD_PREFIX))
        || sans.iter().any(|san| san.starts_with(WILDCARD_PREFIX))
}

/// Strips a leading `*.` from a wildcard name.
pub fn strip_wildcard(name: &str) -> &str {
    name.strip_prefix(WILDCARD_PREFIX).unwrap_or(name)
}

/// DNS-type entries of the subjectAltName extension, in certificate order.
/// IP, email and URI entries are ignored.
fn dns_names(cert: &X509Certificate<'_>) -> Result<Vec<String>, CertificateError> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| CertificateError::X509(e.to_string()))?;

    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.trim().to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}
