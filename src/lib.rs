//! CertWarden - TLS certificate validity monitor
//!
//! This library checks the certificates served by a list of remote domains
//! and the certificates stored in a local directory, exports their remaining
//! lifetime as metrics, follows configuration changes published to a Nacos
//! store, and asks the serving process for a graceful restart when the
//! monitored set shrinks.

pub mod app;
pub mod certificate;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod inspect;
pub mod internal_metrics;
pub mod limiter;
pub mod logging;
pub mod process;
pub mod restart;
pub mod scanner;
pub mod task_manager;
pub mod watcher;

// Re-export core types for convenience
pub use crate::core::*;
