//! # Mock Server Example
//!
//! Showcases a server backed by the scripted [`MockRuntime`], so jobs can be submitted without a container runtime.
//!
//! Scripts are interpreted line by line: `print <text>`, `eprint <text>`, `sleep <secs>`, `exit <code>`.
//! The bearer token is taken as the user id; the token `root` is an administrator.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --example mock_server --features "server mock"
//! curl -X POST localhost:3000/jobs -H 'Authorization: Bearer alice' \
//!     -H 'Content-Type: application/json' -d '{"script": "print hello\nexit 0"}'
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
    let engine = Engine::start(config, MockRuntime::new(), TracingMetrics).await?;

    // Don't use this in production! This is just for demonstration/testing purposes
    let auth = DevAuth::with_admins(["root"]);

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
