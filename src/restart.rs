//! Decides whether the serving process should be restarted after a cycle.
//!
//! A shrinking monitored set usually means the serving process still holds
//! certificates that were removed upstream. Comparing consecutive cycles
//! catches that: fewer distinct identities, or fewer records overall, asks
//! the [`ProcessController`] for a graceful restart.

use crate::core::{CheckCycleResult, ProcessController};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    DomainReduction,
    CertificateCountReduction,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::DomainReduction => "domain reduction",
            RestartReason::CertificateCountReduction => "certificate count reduction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartAction {
    None,
    Restart {
        reason: RestartReason,
        /// Identities present in the previous cycle but not in the current one.
        removed: Vec<String>,
    },
}

fn identities(result: &CheckCycleResult) -> BTreeSet<&str> {
    result.records().map(|r| r.identity()).collect()
}

/// Compares two cycles. Pure; `previous = None` (first cycle) never restarts.
pub fn decide(current: &CheckCycleResult, previous: Option<&CheckCycleResult>) -> RestartAction {
    let Some(previous) = previous else {
        return RestartAction::None;
    };

    let before = identities(previous);
    let after = identities(current);
    let removed: Vec<String> = before.difference(&after).map(|s| s.to_string()).collect();

    if after.len() < before.len() {
        return RestartAction::Restart {
            reason: RestartReason::DomainReduction,
            removed,
        };
    }
    if current.total() < previous.total() {
        return RestartAction::Restart {
            reason: RestartReason::CertificateCountReduction,
            removed,
        };
    }
    RestartAction::None
}

/// Holds the previous cycle and acts on [`decide`].
pub struct RestartDecisionEngine {
    controller: Arc<dyn ProcessController>,
    previous: Mutex<Option<Arc<CheckCycleResult>>>,
}

impl RestartDecisionEngine {
    pub fn new(controller: Arc<dyn ProcessController>) -> Self {
        Self {
            controller,
            previous: Mutex::new(None),
        }
    }

    /// Evaluates `current` against the retained previous cycle, requests a
    /// restart when warranted, and retains `current` for the next call.
    ///
    /// Faulted cycles carry partial data and are neither compared nor
    /// retained. Failures here are logged and swallowed so the check loop
    /// carries on.
    pub async fn evaluate(&self, current: Arc<CheckCycleResult>) -> RestartAction {
        if let Some(fault) = &current.error {
            warn!(%fault, "Skipping restart decision for a faulted cycle");
            return RestartAction::None;
        }

        let previous = self.swap_previous(Arc::clone(&current));
        let action = match catch_unwind(AssertUnwindSafe(|| decide(&current, previous.as_deref()))) {
            Ok(action) => action,
            Err(_) => {
                error!("Restart decision panicked; no restart requested");
                return RestartAction::None;
            }
        };

        if let RestartAction::Restart { reason, removed } = &action {
            info!(
                reason = reason.as_str(),
                removed = ?removed,
                "Monitored certificate set shrank, requesting graceful restart"
            );
            metrics::counter!("restart_requests_total", "reason" => reason.as_str()).increment(1);
            if self.controller.request_graceful_restart().await {
                info!("Graceful restart request dispatched");
            } else {
                warn!("Graceful restart request could not be dispatched");
            }
        } else {
            debug!("Monitored set did not shrink, no restart needed");
        }

        action
    }

    fn swap_previous(&self, current: Arc<CheckCycleResult>) -> Option<Arc<CheckCycleResult>> {
        match self.previous.lock() {
            Ok(mut guard) => guard.replace(current),
            Err(poisoned) => poisoned.into_inner().replace(current),
        }
    }
}
