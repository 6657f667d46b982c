//! # Docker Server Example
//!
//! Showcases a server running every job in a locally managed Docker container.
//!
//! ## Requirements
//!
//! - A reachable Docker daemon (the local socket by default).
//! - The images named by `CORVUS_CPU_IMAGE` and `CORVUS_GPU_IMAGE` (defaults apply when unset).
//! - For GPU jobs, the NVIDIA container toolkit and `CORVUS_GPU_SLOTS` > 0.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --example docker_server --features "server docker"
//! ```

use corvus::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Config
    let config = EngineConfig::from_env()?;
    let server_config = CorvusServerConfig::from_env();

    // Providers & Services
    let runtime = DockerSandbox::connect_local().await?;
    let engine = Engine::start(config, runtime, TracingMetrics).await?;

    // Don't use this in production! Replace with a real AuthProvider.
    let auth = DevAuth::default();

    let services = CoreServices {
        engine: engine.clone(),
        auth,
    };

    // Build
    let app = CorvusServer::new(server_config.clone()).build(services);

    // Serve
    tracing::info!("Server listening on http://{}", server_config.bind);
    let listener = tokio::net::TcpListener::bind(server_config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}
