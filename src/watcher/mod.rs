//! Remote configuration watcher with hot reload.
//!
//! The [`ConfigWatcher`] owns the authoritative [`MonitoringConfig`]. A
//! background loop polls the [`ConfigSource`], skips documents whose content
//! hash has already been applied, and otherwise parses, merges and validates
//! the new document before swapping it in as a whole. A bad document is
//! logged and ignored; the last good configuration stays live.
//!
//! After a successful swap the watcher pushes a changed log level to every
//! registered [`LogLevelSink`] and hands the new snapshot to every
//! [`ConfigSubscriber`].

pub mod nacos;

pub use nacos::{FetchError, NacosClient};

use crate::config::{ConfigError, ConfigHandle, MonitoringConfig, RemoteDocument};
use crate::core::{ConfigSource, ConfigSubscriber, LogLevelSink};
use crate::task_manager::TaskManager;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Lower bound for the delay after a failed poll.
pub const MIN_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Delay before retrying after a failed poll: never shorter than
/// [`MIN_ERROR_BACKOFF`], so a failing store is not hammered.
pub fn error_backoff(poll_interval: Duration) -> Duration {
    poll_interval.max(MIN_ERROR_BACKOFF)
}

/// Lifecycle of the polling loop. Each poll inside `Polling` either finds
/// the content unchanged or applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Polling,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Same content hash as the last applied document.
    Unchanged,
    /// A new configuration is live.
    Applied(Arc<MonitoringConfig>),
}

pub struct ConfigWatcher {
    source: Arc<dyn ConfigSource>,
    config: ConfigHandle,
    state: Mutex<WatcherState>,
    last_hash: Mutex<Option<blake3::Hash>>,
    subscribers: RwLock<Vec<Arc<dyn ConfigSubscriber>>>,
    log_sinks: RwLock<Vec<Arc<dyn LogLevelSink>>>,
    stop_tx: watch::Sender<bool>,
    // Serialises polls so the hash check and the swap happen together.
    poll_lock: tokio::sync::Mutex<()>,
}

impl ConfigWatcher {
    pub fn new(source: Arc<dyn ConfigSource>, initial: MonitoringConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            source,
            config: ConfigHandle::new(initial),
            state: Mutex::new(WatcherState::Idle),
            last_hash: Mutex::new(None),
            subscribers: RwLock::new(Vec::new()),
            log_sinks: RwLock::new(Vec::new()),
            stop_tx,
            poll_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A read-only handle to the live configuration.
    pub fn handle(&self) -> ConfigHandle {
        self.config.clone()
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers an observer invoked after every applied change.
    pub fn subscribe(&self, subscriber: Arc<dyn ConfigSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(subscriber);
    }

    /// Registers a log output that follows `log_level` changes.
    pub fn register_log_sink(&self, sink: Arc<dyn LogLevelSink>) {
        self.log_sinks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(sink);
    }

    /// Starts the polling loop on `tasks`. Returns `false` without spawning
    /// anything if the loop is already running or has been stopped.
    pub fn start(self: &Arc<Self>, tasks: &TaskManager) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != WatcherState::Idle {
                debug!(state = ?*state, "Config watcher already started, ignoring start()");
                return false;
            }
            *state = WatcherState::Polling;
        }

        let watcher = Arc::clone(self);
        let shutdown_rx = tasks.get_shutdown_rx();
        tasks.spawn("ConfigWatcher", watcher.run(shutdown_rx));
        info!("Config watcher started");
        true
    }

    /// Stops the loop at its next iteration boundary. A poll in progress is
    /// allowed to finish.
    pub fn stop(&self) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = WatcherState::Stopped;
        self.stop_tx.send_replace(true);
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() || *shutdown_rx.borrow() {
                break;
            }

            let delay = match AssertUnwindSafe(self.poll_once()).catch_unwind().await {
                Ok(Ok(outcome)) => {
                    if outcome == PollOutcome::Unchanged {
                        trace!("Remote configuration unchanged");
                    }
                    self.config.snapshot().poll_interval()
                }
                Ok(Err(e)) => {
                    metrics::counter!("config_poll_failures_total").increment(1);
                    let delay = error_backoff(self.config.snapshot().poll_interval());
                    warn!(error = %e, retry_in_secs = delay.as_secs(), "Config poll failed, keeping current configuration");
                    delay
                }
                Err(_) => {
                    metrics::counter!("config_poll_failures_total").increment(1);
                    error!("Config poll panicked, keeping current configuration");
                    error_backoff(self.config.snapshot().poll_interval())
                }
            };

            tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                _ = shutdown_rx.changed() => {
                    info!("Config watcher received shutdown signal.");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = WatcherState::Stopped;
        info!("Config watcher stopped.");
    }

    /// Performs one poll: fetch, hash, and apply if the content is new.
    pub async fn poll_once(&self) -> Result<PollOutcome, ConfigError> {
        let _guard = self.poll_lock.lock().await;

        let raw = self.source.fetch().await?;
        let hash = blake3::hash(raw.as_bytes());
        if *self.last_hash.lock().unwrap_or_else(|p| p.into_inner()) == Some(hash) {
            return Ok(PollOutcome::Unchanged);
        }

        let doc = RemoteDocument::parse(&raw)?;
        let previous = self.config.snapshot();
        let next = Arc::new(previous.merged_with(&doc)?);

        self.config.store(Arc::clone(&next));
        *self.last_hash.lock().unwrap_or_else(|p| p.into_inner()) = Some(hash);
        metrics::counter!("config_reloads_total").increment(1);
        info!(
            hash = %&hash.to_hex()[..12],
            domains = next.domains.len(),
            check_interval = next.check_interval,
            max_concurrent_checks = next.max_concurrent_checks,
            "Applied new monitoring configuration"
        );

        if next.log_level != previous.log_level {
            self.propagate_log_level(&next);
        }
        if next.metrics_port != previous.metrics_port {
            warn!(
                old = previous.metrics_port,
                new = next.metrics_port,
                "metrics_port changed; the metrics endpoint keeps its port until restart"
            );
        }
        self.notify_subscribers(&next);

        Ok(PollOutcome::Applied(next))
    }

    fn propagate_log_level(&self, config: &MonitoringConfig) {
        let sinks = self.log_sinks.read().unwrap_or_else(|p| p.into_inner()).clone();
        for sink in sinks {
            if let Err(e) = sink.set_level(config.log_level) {
                warn!(error = %e, level = %config.log_level, "Failed to update log level");
            }
        }
        info!(level = %config.log_level, "Log level updated");
    }

    fn notify_subscribers(&self, config: &Arc<MonitoringConfig>) {
        let subscribers = self.subscribers.read().unwrap_or_else(|p| p.into_inner()).clone();
        for subscriber in subscribers {
            subscriber.on_config_change(Arc::clone(config));
        }
    }
}
