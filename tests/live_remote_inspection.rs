//! Probes real public hosts. Run with `--features live-tests`.

use certwarden::{
    inspect::{NativeTlsProbe, RemoteCertInspector},
    limiter::ConcurrencyLimiter,
};
use std::sync::Arc;
use std::time::Duration;

fn inspector() -> Arc<RemoteCertInspector> {
    Arc::new(RemoteCertInspector::new(
        Arc::new(NativeTlsProbe::new()),
        Arc::new(ConcurrencyLimiter::new("live", 4)),
    ))
}

#[tokio::test]
async fn test_live_public_hosts() {
    let domains = vec!["www.rust-lang.org".to_string(), "crates.io".to_string()];
    let records = inspector().check_all(&domains, Duration::from_secs(10)).await;

    assert_eq!(records.len(), 2);
    for record in &records {
        let days = record
            .expire_in_days()
            .unwrap_or_else(|| panic!("{} failed: {:?}", record.identity(), record.error()));
        assert!(days >= 0, "{} is expired", record.identity());
        assert!(!record.subject_alternative_names().is_empty());
    }
}

#[tokio::test]
async fn test_live_expired_host_is_an_error_record() {
    let domains = vec!["expired.badssl.com".to_string()];
    let records = inspector().check_all(&domains, Duration::from_secs(10)).await;

    assert_eq!(records.len(), 1);
    assert!(!records[0].is_ok());
    assert!(records[0].error().is_some());
}

#[tokio::test]
async fn test_live_unresolvable_host() {
    let domains = vec!["does-not-exist.invalid".to_string()];
    let records = inspector().check_all(&domains, Duration::from_secs(5)).await;
    assert!(records[0].error().is_some());
}
