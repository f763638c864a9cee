mod helpers;

use anyhow::Result;
use certwarden::{
    core::{CertSource, CertificateRecord},
    limiter::ConcurrencyLimiter,
    scanner::LocalCertScanner,
};
use helpers::{cert_dir_with, fixture_der};
use std::sync::Arc;

fn scanner() -> Arc<LocalCertScanner> {
    Arc::new(LocalCertScanner::new(
        Arc::new(ConcurrencyLimiter::new("local_scans", 3)),
        "crt",
        "key",
    ))
}

fn find<'a>(records: &'a [CertificateRecord], identity: &str) -> &'a CertificateRecord {
    records
        .iter()
        .find(|r| r.identity() == identity)
        .unwrap_or_else(|| panic!("no record for {}", identity))
}

#[tokio::test]
async fn test_scan_directory_of_fixtures() -> Result<()> {
    let dir = cert_dir_with(&[
        "api.example.com.crt",
        "api.example.com.key",
        "wildcard.example.org.crt",
        "expired.example.net.crt",
        "LEGACY.CRT",
        "NOCN.CRT",
        "san-wildcard.example.io.crt",
        "corrupt.example.com.crt",
    ]);
    std::fs::write(dir.path().join("README.txt"), "not a certificate")?;

    let records = scanner().scan_all(Some(dir.path())).await;

    // One record per certificate file; the key and text files are ignored.
    assert_eq!(records.len(), 7);
    assert!(records.iter().all(|r| r.source() == CertSource::Local));

    let api = find(&records, "api.example.com");
    assert!(api.is_ok());
    assert!(api.has_private_key_adjacent());
    assert!(!api.is_wildcard());
    assert_eq!(api.subject_alternative_names(), ["api.example.com", "www.example.com"]);
    assert!(api.expire_in_days().unwrap() > 20_000);

    let wildcard = find(&records, "wildcard.example.org");
    assert!(wildcard.is_wildcard());
    assert!(!wildcard.has_private_key_adjacent());

    let san_wildcard = find(&records, "san-wildcard.example.io");
    assert!(san_wildcard.is_wildcard());

    let expired = find(&records, "expired.example.net");
    assert!(expired.is_ok());
    assert!(expired.expire_in_days().unwrap() < 0);

    // Upper-case suffix: identity comes from the common name.
    let legacy = find(&records, "legacy.example.com");
    assert!(legacy.is_ok());
    assert!(legacy.is_wildcard());
    assert!(legacy.subject_alternative_names().is_empty());

    // No common name either: the bare file stem.
    let nocn = find(&records, "NOCN");
    assert!(nocn.is_ok());

    let corrupt = find(&records, "corrupt.example.com");
    assert!(!corrupt.is_ok());
    assert!(corrupt.expire_in_days().is_none());
    assert!(corrupt.error().is_some());
    Ok(())
}

#[tokio::test]
async fn test_results_do_not_depend_on_concurrency() -> Result<()> {
    let dir = cert_dir_with(&[
        "api.example.com.crt",
        "wildcard.example.org.crt",
        "expired.example.net.crt",
        "corrupt.example.com.crt",
    ]);

    let serial = Arc::new(LocalCertScanner::new(
        Arc::new(ConcurrencyLimiter::new("serial", 1)),
        "crt",
        "key",
    ));
    let a = serial.scan_all(Some(dir.path())).await;
    let b = scanner().scan_all(Some(dir.path())).await;

    let ids = |records: &[CertificateRecord]| records.iter().map(|r| r.identity().to_string()).collect::<Vec<_>>();
    assert_eq!(ids(&a), ids(&b));
    Ok(())
}

#[tokio::test]
async fn test_empty_directory_yields_no_records() -> Result<()> {
    let dir = tempfile::tempdir()?;
    assert!(scanner().scan_all(Some(dir.path())).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_der_encoded_file_is_parsed() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("binary.example.com.crt");
    std::fs::write(&path, fixture_der("api.example.com.crt"))?;

    let record = scanner().scan_file(&path).await;

    assert!(record.is_ok(), "{:?}", record.error());
    assert_eq!(record.identity(), "binary.example.com");
    assert_eq!(record.subject_alternative_names().len(), 2);
    assert!(record.expire_in_days().unwrap() > 20_000);
    Ok(())
}
