//! Http serves the introspection surface: `/readyz`, `/healthz`, and
//! Prometheus `/metrics`, all on one listener.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{Router, extract::State, http::StatusCode, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Error, HealthSignal, Result};

/// Introspection owns the health flags and the installed metrics recorder.
#[derive(Clone)]
pub struct Introspection {
    state: Arc<ServerState>,
}

struct ServerState {
    ready: AtomicBool,
    healthy: AtomicBool,
    prometheus: PrometheusHandle,
}

impl Introspection {
    /// New installs the process-wide Prometheus recorder and prepares the
    /// server state. Both flags start false.
    pub fn new() -> Result<Self> {
        let prometheus = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|err| Error::Config(format!("prometheus recorder: {err}")))?;
        Ok(Self {
            state: Arc::new(ServerState {
                ready: AtomicBool::new(false),
                healthy: AtomicBool::new(false),
                prometheus,
            }),
        })
    }

    /// Update_readyz returns the callback flipping the readiness flag.
    pub fn update_readyz(&self) -> HealthSignal {
        let state = self.state.clone();
        Arc::new(move |up| state.ready.store(up, Ordering::SeqCst))
    }

    /// Update_healthz returns the callback flipping the liveness flag.
    pub fn update_healthz(&self) -> HealthSignal {
        let state = self.state.clone();
        Arc::new(move |up| state.healthy.store(up, Ordering::SeqCst))
    }

    /// Serve answers on `addr` until the token is cancelled.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let app = Router::new()
            .route("/readyz", get(readyz))
            .route("/healthz", get(healthz))
            .route("/metrics", get(metrics))
            .with_state(self.state);
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "started introspection server");
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }
}

async fn readyz(State(state): State<Arc<ServerState>>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Ready!")
    }
}

async fn healthz(State(state): State<Arc<ServerState>>) -> (StatusCode, &'static str) {
    if state.healthy.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not Healthy!")
    }
}

async fn metrics(State(state): State<Arc<ServerState>>) -> String {
    state.prometheus.render()
}
