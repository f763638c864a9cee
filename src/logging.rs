//! Process-wide log output.
//!
//! Logs go through `tracing`; records emitted with the `log` macros are
//! bridged in by the subscriber's `tracing-log` integration. The level
//! filter sits behind a reload layer so the config watcher can change it
//! at runtime. An explicit `RUST_LOG` pins the filter and wins over both the
//! configured level and later changes.

use crate::config::LogLevel;
use crate::core::LogLevelSink;
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

/// Handle to the installed filter; implements [`LogLevelSink`].
#[derive(Clone)]
pub struct ReloadLogSink {
    handle: reload::Handle<EnvFilter, Registry>,
    pinned: bool,
}

impl std::fmt::Debug for ReloadLogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadLogSink")
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

/// Builds the filter for a configured level. `fatal` maps to `error`.
pub fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::new(level.as_filter())
}

/// Installs the global subscriber at `level`. Fails if a global subscriber
/// is already set.
pub fn init(level: LogLevel) -> Result<ReloadLogSink> {
    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (filter_for(level), false),
    };
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))?;

    Ok(ReloadLogSink { handle, pinned })
}

impl LogLevelSink for ReloadLogSink {
    fn set_level(&self, level: LogLevel) -> Result<()> {
        if self.pinned {
            tracing::debug!(%level, "RUST_LOG is set, ignoring log level change");
            return Ok(());
        }
        self.handle
            .reload(filter_for(level))
            .map_err(|e| anyhow!("failed to reload log filter: {}", e))
    }
}
