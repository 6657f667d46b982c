use crate::{api, prelude::*};
use corvus_core::prelude::*;
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

/// The builder for the Corvus Server.
#[derive(Clone, Debug, Default)]
pub struct CorvusServer {
    config: CorvusServerConfig,
}

impl CorvusServer {
    pub fn new(config: CorvusServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorvusServerConfig {
        &self.config
    }
}

#[derive(Clone, Debug)]
pub struct CorvusServerConfig {
    /// The address the listener binds to.
    ///
    /// Defaults to `0.0.0.0:3000`.
    pub bind: SocketAddr,
}

impl Default for CorvusServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl CorvusServerConfig {
    /// Reads `PORT` from the environment, keeping the default for anything unset or malformed.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        match std::env::var("PORT").ok().map(|p| p.parse::<u16>()) {
            Some(Ok(port)) => config.bind.set_port(port),
            Some(Err(e)) => tracing::warn!(error = %e, "Ignoring invalid PORT"),
            None => {}
        }
        config
    }
}

impl CorvusServer {
    pub fn build<S: CorvusServices>(self, services: S) -> Router {
        Router::new()
            .route(routes::HEALTH, get(api::health))
            .route(routes::JOBS, post(api::submit_job).get(api::list_jobs))
            .route(routes::JOB_ANALYZE, post(api::analyze_script))
            .route(routes::JOB_BY_ID, get(api::get_job))
            .route(routes::JOB_CANCEL, post(api::cancel_job))
            .route(routes::JOB_LOGS, get(api::stream_logs))
            .route(routes::POOLS, get(api::pools))
            .route(routes::METRICS_SUMMARY, get(api::metrics_summary))
            .route(routes::METRICS_USER, get(api::user_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(AppState { services })
    }
}
