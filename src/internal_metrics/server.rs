//! # Metrics Server
//!
//! An `axum` server exposing the Prometheus exposition at `/metrics` and a
//! liveness probe at `/health`. It stops serving when the shutdown signal
//! fires.

use crate::internal_metrics::PrometheusSink;
use axum::{routing::get, Json, Router};
use log::error;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::trace;

pub struct MetricsServer {
    listener: TcpListener,
    prom_handle: PrometheusHandle,
    certificates: PrometheusSink,
    shutdown_rx: watch::Receiver<bool>,
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Routes served by the exporter; split out so they can be exercised
/// without binding a socket.
pub fn router(prom_handle: PrometheusHandle, certificates: PrometheusSink) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || async move {
                let mut body = prom_handle.render();
                body.push_str(&certificates.render());
                body
            }),
        )
        .route("/health", get(health))
}

impl MetricsServer {
    /// Creates a new `MetricsServer` on an already bound listener.
    pub fn new(
        listener: TcpListener,
        prom_handle: PrometheusHandle,
        certificates: PrometheusSink,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            prom_handle,
            certificates,
            shutdown_rx,
        }
    }

    /// Returns a future that runs the server until a shutdown signal is received.
    pub fn run(mut self) -> impl Future<Output = ()> {
        let app = router(self.prom_handle.clone(), self.certificates.clone());

        async move {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    trace!("Metrics server received shutdown signal via select.");
                }
                result = axum::serve(self.listener, app.into_make_service()) => {
                    if let Err(e) = result {
                        error!("Metrics server error: {}", e);
                    }
                }
            }
            trace!("Metrics server task finished.");
        }
    }
}
