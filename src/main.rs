//! CertWarden - TLS certificate validity monitor
//!
//! Watches remote and local certificates, exports their lifetime to
//! Prometheus and hot-reloads its configuration from Nacos.

use anyhow::{Context, Result};
use certwarden::{app::App, cli::Cli, config::Config, logging};
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let once = cli.once;

    let config = match Config::load_from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {:#}", err);
            std::process::exit(1);
        }
    };

    let log_sink = Arc::new(logging::init(config.monitoring.log_level)?);

    info!("CertWarden starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.monitoring.log_level);
    info!("Check Interval: {}s", config.monitoring.check_interval);
    info!("Metrics Port: {}", config.monitoring.metrics_port);
    match &config.domains_file {
        Some(path) => info!("Domains File: {}", path.display()),
        None => info!("Domains File: Not configured"),
    }
    if config.nacos.enabled {
        info!(
            "Nacos: {} (dataId={}, group={})",
            config.nacos.server_addr, config.nacos.data_id, config.nacos.group
        );
    } else {
        info!("Nacos: Disabled");
    }
    info!(
        "Local Certificates: {}",
        if config.local_certs.enabled { "Enabled" } else { "Disabled" }
    );
    info!(
        "Process Restarts: {}",
        if config.process.restart_enabled {
            format!("SIG{} via {}", config.process.signal, config.process.pid_file.display())
        } else {
            "Disabled".to_string()
        }
    );
    info!("-------------------------------------------------------");

    if once {
        let result = App::builder(config)
            .log_sink(log_sink)
            .metrics_enabled(false)
            .run_once()
            .await?;
        let json = serde_json::to_string_pretty(&result).context("failed to serialise check result")?;
        println!("{}", json);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = match App::builder(config).log_sink(log_sink).build(shutdown_rx).await {
        Ok(app) => app,
        Err(err) => {
            error!("Failed to start: {:#}", err);
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received, shutting down...");
        let _ = shutdown_tx.send(true);
    });

    app.run().await
}
