//! The main application logic, decoupled from the entry point.

use crate::{
    config::{Config, ConfigHandle, MonitoringConfig},
    coordinator::{CertDirectories, CheckCoordinator},
    core::{
        CertificateProbe, CheckCycleResult, ConfigSource, ConfigSubscriber, LogLevelSink,
        MetricsSink, ProcessController,
    },
    inspect::{NativeTlsProbe, RemoteCertInspector},
    internal_metrics::{system::SystemCollector, MetricsBuilder, PrometheusSink},
    limiter::ConcurrencyLimiter,
    process::{DisabledController, PidFileController},
    restart::RestartDecisionEngine,
    scanner::LocalCertScanner,
    task_manager::TaskManager,
    watcher::{ConfigWatcher, NacosClient},
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument};

/// Wakes the check loop for an out-of-cycle check after a config change.
struct CheckTrigger {
    notify: Arc<Notify>,
}

impl ConfigSubscriber for CheckTrigger {
    fn on_config_change(&self, _config: Arc<MonitoringConfig>) {
        // notify_one keeps a permit if the loop is mid-cycle.
        self.notify.notify_one();
    }
}

/// A handle to the running application, containing all its task handles.
pub struct App {
    task_manager: TaskManager,
    metrics_addr: Option<SocketAddr>,
    config: ConfigHandle,
    watcher: Option<Arc<ConfigWatcher>>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// The live monitoring configuration.
    pub fn config(&self) -> ConfigHandle {
        self.config.clone()
    }

    /// The remote config watcher, when a remote store is configured.
    pub fn watcher(&self) -> Option<&Arc<ConfigWatcher>> {
        self.watcher.as_ref()
    }

    /// Waits for the shutdown signal and then gracefully shuts down all tasks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        if !*shutdown_rx.borrow() {
            shutdown_rx.changed().await.ok();
        }
        info!("Shutdown signal received. Waiting for tasks to complete...");

        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.task_manager.shutdown().await;

        info!("All tasks shut down.");
        Ok(())
    }
}

/// The wired-up components, before any background task is spawned.
struct Components {
    config: ConfigHandle,
    watcher: Option<Arc<ConfigWatcher>>,
    coordinator: Arc<CheckCoordinator>,
    restart: Arc<RestartDecisionEngine>,
}

/// Builder for the main application.
///
/// Separates constructing the components from running them, and lets tests
/// swap out the collaborators that touch the network or other processes.
pub struct AppBuilder {
    config: Config,
    probe_override: Option<Arc<dyn CertificateProbe>>,
    sink_override: Option<Arc<dyn MetricsSink>>,
    controller_override: Option<Arc<dyn ProcessController>>,
    config_source_override: Option<Arc<dyn ConfigSource>>,
    log_sink: Option<Arc<dyn LogLevelSink>>,
    metrics_enabled: bool,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            probe_override: None,
            sink_override: None,
            controller_override: None,
            config_source_override: None,
            log_sink: None,
            metrics_enabled: true,
        }
    }

    /// Overrides the TLS probe for testing.
    pub fn probe_override(mut self, probe: Arc<dyn CertificateProbe>) -> Self {
        self.probe_override = Some(probe);
        self
    }

    /// Overrides the metrics sink. The Prometheus recorder is still
    /// installed unless metrics are disabled.
    pub fn sink_override(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink_override = Some(sink);
        self
    }

    /// Overrides the process controller for testing.
    pub fn controller_override(mut self, controller: Arc<dyn ProcessController>) -> Self {
        self.controller_override = Some(controller);
        self
    }

    /// Uses `source` as the remote configuration store, whether or not the
    /// Nacos section is enabled.
    pub fn config_source_override(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source_override = Some(source);
        self
    }

    /// Registers the log output that follows `log_level` changes.
    pub fn log_sink(mut self, sink: Arc<dyn LogLevelSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Disables the Prometheus recorder, the HTTP endpoint and the system
    /// collector.
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    fn config_source(&self) -> Result<Option<Arc<dyn ConfigSource>>> {
        if let Some(source) = &self.config_source_override {
            return Ok(Some(Arc::clone(source)));
        }
        if !self.config.nacos.enabled {
            return Ok(None);
        }
        let client = NacosClient::new(&self.config.nacos).context("failed to create Nacos client")?;
        debug!(url = client.url(), data_id = %self.config.nacos.data_id, "Remote configuration store enabled");
        Ok(Some(Arc::new(client)))
    }

    /// Loads the initial configuration and wires the components. A failure
    /// to obtain a valid first configuration is fatal.
    async fn assemble(&self, sink: Arc<dyn MetricsSink>) -> Result<Components> {
        let initial = self.config.initial_monitoring_config()?;

        let (watcher, config) = match self.config_source()? {
            Some(source) => {
                let watcher = Arc::new(ConfigWatcher::new(source, initial));
                if let Some(log_sink) = &self.log_sink {
                    watcher.register_log_sink(Arc::clone(log_sink));
                }
                watcher
                    .poll_once()
                    .await
                    .context("initial configuration load from the remote store failed")?;
                let config = watcher.handle();
                (Some(watcher), config)
            }
            None => {
                if let Some(log_sink) = &self.log_sink {
                    log_sink.set_level(initial.log_level)?;
                }
                (None, ConfigHandle::new(initial))
            }
        };

        let snapshot = config.snapshot();
        let probe = self
            .probe_override
            .clone()
            .unwrap_or_else(|| Arc::new(NativeTlsProbe::new()));
        let inspector = Arc::new(RemoteCertInspector::new(
            probe,
            Arc::new(ConcurrencyLimiter::new("remote_checks", snapshot.max_concurrent_checks)),
        ));

        let local = &self.config.local_certs;
        let scanner = Arc::new(LocalCertScanner::new(
            Arc::new(ConcurrencyLimiter::new("local_scans", snapshot.max_concurrent_checks)),
            local.cert_extension.clone(),
            local.key_extension.clone(),
        ));
        let cert_dirs = local.enabled.then(|| CertDirectories {
            container_dir: local.container_dir.clone(),
            fallback_dir: local.fallback_dir.clone(),
        });

        let controller: Arc<dyn ProcessController> = match &self.controller_override {
            Some(controller) => Arc::clone(controller),
            None if self.config.process.restart_enabled => Arc::new(PidFileController::new(
                self.config.process.pid_file.clone(),
                self.config.process.signal.clone(),
            )),
            None => Arc::new(DisabledController),
        };

        Ok(Components {
            coordinator: Arc::new(CheckCoordinator::new(config.clone(), inspector, scanner, sink, cert_dirs)),
            restart: Arc::new(RestartDecisionEngine::new(controller)),
            config,
            watcher,
        })
    }

    fn sink(&self, prometheus: &PrometheusSink) -> Arc<dyn MetricsSink> {
        self.sink_override
            .clone()
            .unwrap_or_else(|| Arc::new(prometheus.clone()))
    }

    /// Runs exactly one check cycle without starting any background task.
    pub async fn run_once(self) -> Result<CheckCycleResult> {
        let components = self.assemble(self.sink(&PrometheusSink::new())).await?;
        Ok(components.coordinator.run_cycle().await)
    }

    /// Builds and initializes all application components, returning a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let task_manager = TaskManager::new(shutdown_rx);
        let prometheus = PrometheusSink::new();
        let components = self.assemble(self.sink(&prometheus)).await?;
        let Components {
            config,
            watcher,
            coordinator,
            restart,
        } = components;

        // =========================================================================
        // 1. Metrics endpoint and process gauges
        // =========================================================================
        let metrics_addr = if self.metrics_enabled {
            match MetricsBuilder::new(config.snapshot().metrics_port).build(prometheus, task_manager.get_shutdown_rx()) {
                Some((server, addr)) => {
                    task_manager.spawn("MetricsServer", server.run());
                    let collector_tm = task_manager.clone();
                    task_manager.spawn_supervised("SystemCollector", move || {
                        SystemCollector::new().run(collector_tm.get_shutdown_rx())
                    });
                    info!(%addr, "Metrics endpoint listening");
                    Some(addr)
                }
                None => None,
            }
        } else {
            None
        };

        // =========================================================================
        // 2. Config watcher
        // =========================================================================
        let trigger = Arc::new(Notify::new());
        if let Some(watcher) = &watcher {
            watcher.subscribe(Arc::new(CheckTrigger {
                notify: Arc::clone(&trigger),
            }));
            watcher.start(&task_manager);
        }

        // =========================================================================
        // 3. Check loop
        // =========================================================================
        let loop_tm = task_manager.clone();
        let loop_config = config.clone();
        task_manager.spawn_supervised("CheckLoop", move || {
            run_check_loop(
                Arc::clone(&coordinator),
                Arc::clone(&restart),
                loop_config.clone(),
                Arc::clone(&trigger),
                loop_tm.get_shutdown_rx(),
            )
        });

        let snapshot = config.snapshot();
        info!(
            domains = snapshot.domains.len(),
            check_interval = snapshot.check_interval,
            remote_config = watcher.is_some(),
            "CertWarden initialized successfully. Monitoring certificates..."
        );

        Ok(App {
            task_manager,
            metrics_addr,
            config,
            watcher,
        })
    }
}

/// Runs a cycle, evaluates the restart decision, then waits for the check
/// interval, a config-change trigger, or shutdown.
async fn run_check_loop(
    coordinator: Arc<CheckCoordinator>,
    restart: Arc<RestartDecisionEngine>,
    config: ConfigHandle,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("Check loop received shutdown signal mid-cycle.");
                break;
            }
            result = coordinator.run_cycle() => Arc::new(result),
        };
        restart.evaluate(result).await;

        let interval = config.snapshot().check_interval();
        debug!(next_check_in_secs = interval.as_secs(), "Waiting for next check cycle");
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("Check loop received shutdown signal.");
                break;
            }
            _ = trigger.notified() => {
                info!("Configuration changed, running an out-of-cycle check");
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
