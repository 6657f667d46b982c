//! # Corvus
//![![License](https://img.shields.io/badge/license-MIT%2FApache-blue.svg)](https://github.com/corvus-rs/corvus?tab=readme-ov-file#license)
//!
//! A job execution engine that runs untrusted user scripts in resource-bounded sandboxes.
//!
//! Jobs are admitted per capacity pool (CPU and GPU), supervised through their whole lifecycle,
//! cancelled or timed out on demand, and their output is fanned out to any number of live or
//! late log subscribers.
//!
//! This crate serves as an entry point, re-exporting the core types and the engine and
//! optionally including the server and sandbox runtimes via feature flags.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | **`server`** | Includes the Axum-based HTTP and WebSocket surface (`corvus_server`). |
//! | **`docker`** | Sandbox runtime backed by the Docker Engine API (`corvus_sandbox_docker`). |
//! | **`mock`** | Scripted in-memory sandbox runtime for tests and local development (`corvus_sandbox_mock`). |
//!
//! ## Example: Custom Server
//!
//! ```toml
//! [dependencies]
//! corvus = { version = "0.3", features = ["server", "docker"] }
//! ```
//!
//! ```rust,no_run
//! use corvus::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = DockerSandbox::connect_local().await?;
//!     let engine = Engine::start(EngineConfig::from_env()?, runtime, TracingMetrics).await?;
//!
//!     // Build
//!     let services = CoreServices { engine, auth: DevAuth::default() };
//!     let app = CorvusServer::default().build(services);
//!
//!     // Serve
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub use corvus_core::*;

pub mod engine {
    pub use corvus_engine::*;
}

#[cfg(feature = "server")]
pub mod server {
    pub use corvus_server::*;
}

#[cfg(feature = "docker")]
pub mod docker {
    pub use corvus_sandbox_docker::*;
}

#[cfg(feature = "mock")]
pub mod mock {
    pub use corvus_sandbox_mock::*;
}

pub mod prelude {
    pub use corvus_engine::prelude::*;

    #[cfg(feature = "server")]
    pub use corvus_server::prelude::*;

    #[cfg(feature = "docker")]
    pub use corvus_sandbox_docker::DockerSandbox;

    #[cfg(feature = "mock")]
    pub use corvus_sandbox_mock::MockRuntime;
}
