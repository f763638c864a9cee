mod helpers;

use anyhow::Result;
use certwarden::{
    config::{ConfigError, LogLevel, MonitoringConfig, NacosConfig},
    core::{ConfigSource, ConfigSubscriber},
    task_manager::TaskManager,
    watcher::{ConfigWatcher, FetchError, NacosClient, PollOutcome, WatcherState},
};
use helpers::fakes::{RecordingLogSink, StaticSource};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DOC_V1: &str = r#"
domains:
  - a.example.com
  - b.example.com
settings:
  check_interval: 600
  nacos_poll_interval: 30
"#;

const DOC_V2: &str = r#"
domains:
  - a.example.com
settings:
  check_interval: 300
  nacos_poll_interval: 30
  log_level: debug
"#;

#[derive(Default)]
struct CountingSubscriber {
    seen: Mutex<Vec<Arc<MonitoringConfig>>>,
}

impl CountingSubscriber {
    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl ConfigSubscriber for CountingSubscriber {
    fn on_config_change(&self, config: Arc<MonitoringConfig>) {
        self.seen.lock().unwrap().push(config);
    }
}

fn watcher(source: Arc<StaticSource>) -> Arc<ConfigWatcher> {
    Arc::new(ConfigWatcher::new(source, MonitoringConfig::default()))
}

#[tokio::test]
async fn test_apply_then_unchanged() -> Result<()> {
    let source = StaticSource::new(DOC_V1);
    let watcher = watcher(source.clone());
    let subscriber = Arc::new(CountingSubscriber::default());
    watcher.subscribe(subscriber.clone());

    let outcome = watcher.poll_once().await?;
    let PollOutcome::Applied(applied) = outcome else {
        panic!("expected the first document to be applied");
    };
    assert_eq!(applied.domains, vec!["a.example.com", "b.example.com"]);
    assert_eq!(applied.check_interval, 600);
    assert_eq!(watcher.handle().snapshot().check_interval, 600);
    assert_eq!(subscriber.count(), 1);

    // Same bytes: nothing is parsed, swapped or announced.
    assert_eq!(watcher.poll_once().await?, PollOutcome::Unchanged);
    assert_eq!(subscriber.count(), 1);
    assert_eq!(source.fetch_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_invalid_document_keeps_last_good_config() -> Result<()> {
    let source = StaticSource::new(DOC_V1);
    let watcher = watcher(source.clone());
    watcher.poll_once().await?;

    source.set("domains: [unclosed");
    assert!(matches!(watcher.poll_once().await, Err(ConfigError::Parse(_))));
    assert_eq!(watcher.handle().snapshot().check_interval, 600);

    source.set("domains: []\n");
    assert!(matches!(watcher.poll_once().await, Err(ConfigError::Validation(_))));

    source.set("settings:\n  check_interval: 0\n");
    assert!(matches!(watcher.poll_once().await, Err(ConfigError::Validation(_))));

    source.set("- just\n- a list\n");
    assert!(watcher.poll_once().await.is_err());

    let snapshot = watcher.handle().snapshot();
    assert_eq!(snapshot.domains, vec!["a.example.com", "b.example.com"]);
    assert_eq!(snapshot.check_interval, 600);

    // A rejected document is retried once it is fixed.
    source.set(DOC_V2);
    assert!(matches!(watcher.poll_once().await?, PollOutcome::Applied(_)));
    assert_eq!(watcher.handle().snapshot().check_interval, 300);
    Ok(())
}

#[tokio::test]
async fn test_rejected_document_is_retried_with_same_content() -> Result<()> {
    let source = StaticSource::new("settings:\n  connect_timeout: -1\n");
    let watcher = watcher(source.clone());

    assert!(watcher.poll_once().await.is_err());
    // The hash only advances on success, so the same bad content fails again
    // rather than being reported as unchanged.
    assert!(watcher.poll_once().await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_fetch_failure_keeps_config() -> Result<()> {
    let source = StaticSource::failing(FetchError::Status(503));
    let watcher = watcher(source.clone());

    let err = watcher.poll_once().await.unwrap_err();
    assert!(matches!(err, ConfigError::Fetch(FetchError::Status(503))));
    assert_eq!(*watcher.handle().snapshot(), MonitoringConfig::default());
    Ok(())
}

#[tokio::test]
async fn test_log_level_change_reaches_sinks() -> Result<()> {
    let source = StaticSource::new(DOC_V1);
    let watcher = watcher(source.clone());
    let sink = Arc::new(RecordingLogSink::default());
    watcher.register_log_sink(sink.clone());

    watcher.poll_once().await?;
    assert!(sink.levels.lock().unwrap().is_empty());

    source.set(DOC_V2);
    watcher.poll_once().await?;
    assert_eq!(*sink.levels.lock().unwrap(), vec![LogLevel::Debug]);
    Ok(())
}

#[tokio::test]
async fn test_subscriber_sees_new_snapshot_after_swap() -> Result<()> {
    struct CheckingSubscriber {
        handle: certwarden::config::ConfigHandle,
        ok: AtomicUsize,
    }
    impl ConfigSubscriber for CheckingSubscriber {
        fn on_config_change(&self, config: Arc<MonitoringConfig>) {
            if *self.handle.snapshot() == *config {
                self.ok.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let watcher = watcher(StaticSource::new(DOC_V1));
    let subscriber = Arc::new(CheckingSubscriber {
        handle: watcher.handle(),
        ok: AtomicUsize::new(0),
    });
    watcher.subscribe(subscriber.clone());
    watcher.poll_once().await?;
    assert_eq!(subscriber.ok.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() -> Result<()> {
    let source = StaticSource::new(DOC_V1);
    let watcher = watcher(source.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = TaskManager::new(shutdown_rx);

    assert_eq!(watcher.state(), WatcherState::Idle);
    assert!(watcher.start(&tasks));
    assert!(!watcher.start(&tasks));
    assert_eq!(watcher.state(), WatcherState::Polling);

    // Polls at 0s, 30s and 60s from a single loop.
    tokio::time::sleep(Duration::from_secs(65)).await;
    assert_eq!(source.fetch_count(), 3);

    shutdown_tx.send(true)?;
    tasks.shutdown().await;
    assert_eq!(watcher.state(), WatcherState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_polls_back_off_at_least_ten_seconds() -> Result<()> {
    let source = StaticSource::failing(FetchError::Transport("connection refused".to_string()));
    let initial = MonitoringConfig {
        nacos_poll_interval: 1,
        ..Default::default()
    };
    let watcher = Arc::new(ConfigWatcher::new(source.clone(), initial));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = TaskManager::new(shutdown_rx);
    watcher.start(&tasks);

    // Attempts at 0s, 10s and 20s.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(source.fetch_count(), 3);

    shutdown_tx.send(true)?;
    tasks.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_halts_polling_and_blocks_restart() -> Result<()> {
    let source = StaticSource::new(DOC_V1);
    let watcher = watcher(source.clone());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = TaskManager::new(shutdown_rx);

    watcher.start(&tasks);
    tokio::time::sleep(Duration::from_secs(1)).await;
    watcher.stop();
    tasks.clone().shutdown().await;
    let fetched = source.fetch_count();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.fetch_count(), fetched);
    assert_eq!(watcher.state(), WatcherState::Stopped);
    assert!(!watcher.start(&tasks));
    Ok(())
}

#[tokio::test]
async fn test_nacos_client_queries_config_endpoint() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nacos/v1/cs/configs"))
        .and(query_param("dataId", "certwarden.yaml"))
        .and(query_param("group", "DEFAULT_GROUP"))
        .and(query_param("tenant", "prod"))
        .and(query_param_is_missing("username"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DOC_V1))
        .expect(1)
        .mount(&server)
        .await;

    let client = NacosClient::new(&NacosConfig {
        enabled: true,
        server_addr: server.uri(),
        namespace: Some("prod".to_string()),
        ..Default::default()
    })?;

    assert_eq!(client.fetch().await?, DOC_V1);
    Ok(())
}

#[tokio::test]
async fn test_nacos_client_sends_credentials() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nacos/v1/cs/configs"))
        .and(query_param("username", "monitor"))
        .and(query_param("password", "secret"))
        .and(query_param_is_missing("tenant"))
        .respond_with(ResponseTemplate::new(200).set_body_string("domains: [a.example.com]\n"))
        .expect(1)
        .mount(&server)
        .await;

    let client = NacosClient::new(&NacosConfig {
        server_addr: format!("{}/", server.uri()),
        username: Some("monitor".to_string()),
        password: Some("secret".to_string()),
        ..Default::default()
    })?;
    assert_eq!(client.fetch().await?, "domains: [a.example.com]\n");
    Ok(())
}

#[tokio::test]
async fn test_nacos_client_non_success_status() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("config data not exist"))
        .mount(&server)
        .await;

    let client = NacosClient::new(&NacosConfig {
        server_addr: server.uri(),
        ..Default::default()
    })?;
    assert_eq!(client.fetch().await.unwrap_err(), FetchError::Status(404));
    Ok(())
}

#[tokio::test]
async fn test_watcher_over_http() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/nacos/v1/cs/configs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(DOC_V2))
        .mount(&server)
        .await;

    let client = NacosClient::new(&NacosConfig {
        server_addr: server.uri(),
        ..Default::default()
    })?;
    let watcher = ConfigWatcher::new(Arc::new(client), MonitoringConfig::default());

    assert!(matches!(watcher.poll_once().await?, PollOutcome::Applied(_)));
    assert_eq!(watcher.poll_once().await?, PollOutcome::Unchanged);
    assert_eq!(watcher.handle().snapshot().log_level, LogLevel::Debug);
    Ok(())
}
