use async_trait::async_trait;
use certwarden::{
    config::LogLevel,
    core::{CertSource, CertificateProbe, ConfigSource, LogLevelSink, MetricsSink, ProcessController},
    inspect::InspectError,
    watcher::FetchError,
};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::Notify;

/// A probe answering from a fixed table; unknown domains refuse the
/// connection. Tracks peak concurrency.
pub struct FakeProbe {
    answers: Mutex<HashMap<String, Result<Vec<u8>, InspectError>>>,
    delay: Duration,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn serve(self, domain: &str, der: Vec<u8>) -> Self {
        self.answers.lock().unwrap().insert(domain.to_string(), Ok(der));
        self
    }

    pub fn fail(self, domain: &str, error: InspectError) -> Self {
        self.answers.lock().unwrap().insert(domain.to_string(), Err(error));
        self
    }
}

#[async_trait]
impl CertificateProbe for FakeProbe {
    async fn fetch_leaf_certificate(&self, domain: &str, _timeout: Duration) -> Result<Vec<u8>, InspectError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.answers
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .unwrap_or_else(|| Err(InspectError::Connect(domain.to_string(), "connection refused".to_string())))
    }
}

/// Remembers the last value pushed for each (identity, source) pair.
#[derive(Default)]
pub struct RecordingSink {
    pub validity: Mutex<HashMap<(String, CertSource), bool>>,
    pub expire_days: Mutex<HashMap<(String, CertSource), i64>>,
    pub wildcard: Mutex<HashMap<(String, CertSource), bool>>,
    pub san_count: Mutex<HashMap<(String, CertSource), usize>>,
    pub removed: Mutex<Vec<(String, CertSource)>>,
    pub notify: Notify,
}

impl RecordingSink {
    pub fn validity(&self, identity: &str, source: CertSource) -> Option<bool> {
        self.validity.lock().unwrap().get(&(identity.to_string(), source)).copied()
    }

    pub fn expire_days(&self, identity: &str, source: CertSource) -> Option<i64> {
        self.expire_days.lock().unwrap().get(&(identity.to_string(), source)).copied()
    }

    pub fn wildcard(&self, identity: &str, source: CertSource) -> Option<bool> {
        self.wildcard.lock().unwrap().get(&(identity.to_string(), source)).copied()
    }

    pub fn san_count(&self, identity: &str, source: CertSource) -> Option<usize> {
        self.san_count.lock().unwrap().get(&(identity.to_string(), source)).copied()
    }

    /// Waits until a validity value has been recorded for `identity`.
    pub async fn wait_for(&self, identity: &str, source: CertSource, timeout: Duration) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.validity(identity, source).is_some() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .expect("Timed out waiting for metrics");
    }
}

impl MetricsSink for RecordingSink {
    fn set_validity(&self, identity: &str, source: CertSource, valid: bool) {
        self.validity.lock().unwrap().insert((identity.to_string(), source), valid);
        self.notify.notify_waiters();
    }

    fn set_expire_days(&self, identity: &str, source: CertSource, days: i64) {
        self.expire_days.lock().unwrap().insert((identity.to_string(), source), days);
    }

    fn set_wildcard(&self, identity: &str, source: CertSource, wildcard: bool) {
        self.wildcard.lock().unwrap().insert((identity.to_string(), source), wildcard);
    }

    fn set_san_count(&self, identity: &str, source: CertSource, count: usize) {
        self.san_count.lock().unwrap().insert((identity.to_string(), source), count);
    }

    fn remove(&self, identity: &str, source: CertSource) {
        let key = (identity.to_string(), source);
        self.validity.lock().unwrap().remove(&key);
        self.expire_days.lock().unwrap().remove(&key);
        self.wildcard.lock().unwrap().remove(&key);
        self.san_count.lock().unwrap().remove(&key);
        self.removed.lock().unwrap().push(key);
    }
}

/// Counts restart requests.
#[derive(Default)]
pub struct RecordingController {
    pub requests: AtomicUsize,
    pub notify: Notify,
}

impl RecordingController {
    pub fn count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub async fn wait_for_request(&self, timeout: Duration) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count() > 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .expect("Timed out waiting for a restart request");
    }
}

#[async_trait]
impl ProcessController for RecordingController {
    async fn request_graceful_restart(&self) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        true
    }
}

/// A configuration store whose document can be swapped mid-test.
pub struct StaticSource {
    document: Mutex<Result<String, FetchError>>,
    pub fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(document: &str) -> Arc<Self> {
        Arc::new(Self {
            document: Mutex::new(Ok(document.to_string())),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn failing(error: FetchError) -> Arc<Self> {
        Arc::new(Self {
            document: Mutex::new(Err(error)),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, document: &str) {
        *self.document.lock().unwrap() = Ok(document.to_string());
    }

    pub fn set_error(&self, error: FetchError) {
        *self.document.lock().unwrap() = Err(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for StaticSource {
    async fn fetch(&self) -> Result<String, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.document.lock().unwrap().clone()
    }
}

/// Records every level it is asked to apply.
#[derive(Default)]
pub struct RecordingLogSink {
    pub levels: Mutex<Vec<LogLevel>>,
}

impl LogLevelSink for RecordingLogSink {
    fn set_level(&self, level: LogLevel) -> anyhow::Result<()> {
        self.levels.lock().unwrap().push(level);
        Ok(())
    }
}
