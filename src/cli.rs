//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. These arguments are parsed at startup and then merged with
//! the configuration from the `certwarden.toml` file and environment variables.

use crate::config::LogLevel;
use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// Continuously verifies remote and local TLS certificates and exports the
/// results as Prometheus metrics.
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Initial log level; the remote configuration may change it later.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Port for the metrics and health endpoints.
    #[arg(long, value_name = "PORT")]
    pub metrics_port: Option<u16>,

    /// Local YAML document with `domains` and `settings`, applied at startup.
    #[arg(long, value_name = "FILE")]
    pub domains_file: Option<PathBuf>,

    /// Run a single check cycle, print the result as JSON and exit.
    #[arg(long)]
    pub once: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();
        let mut monitoring = Dict::new();

        if let Some(level) = self.log_level {
            monitoring.insert("log_level".into(), Value::from(level.as_str()));
        }

        if let Some(port) = self.metrics_port {
            monitoring.insert("metrics_port".into(), Value::from(port));
        }

        if !monitoring.is_empty() {
            dict.insert("monitoring".into(), Value::from(monitoring));
        }

        if let Some(path) = &self.domains_file {
            dict.insert(
                "domains_file".into(),
                Value::from(path.to_string_lossy().into_owned()),
            );
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
