//! # Corvus Server
//!
//! An Axum-based HTTP and WebSocket surface for the corvus [`Engine`](corvus_engine::engine::Engine).
//!
//! Provides the [`CorvusServer`](server::CorvusServer) builder, which ties a running engine and an
//! authentication provider together behind a [`CorvusServices`](services::CorvusServices) implementation.
//!
//! ## Permissions
//!
//! Authentication providers must grant the following scopes in their `User` object:
//!
//! * **`job:submit`**: to submit jobs.
//! * **`job:read`**: to read job status, list jobs, stream logs and inspect pools.
//! * **`job:cancel`**: to cancel jobs.
//! * **`admin`**: Full access, including other owners' jobs.
//!
//! ## Routes
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `GET` | `/health` | `OK`, or `503` when the sandbox runtime is unreachable |
//! | `POST` | `/jobs` | `201` with the new job id |
//! | `POST` | `/jobs/analyze` | The profile and mode automatic allocation would pick |
//! | `GET` | `/jobs` | The caller's jobs, newest first |
//! | `GET` | `/jobs/{id}` | One job snapshot |
//! | `POST` | `/jobs/{id}/cancel` | The cancel acknowledgement |
//! | `GET` | `/jobs/{id}/logs` | WebSocket of JSON log frames, closed with an `end` frame |
//! | `GET` | `/pools` | Capacity pool occupancy |
//! | `GET` | `/metrics/summary` | Job counts, pool occupancy and completion statistics |
//! | `GET` | `/metrics/user` | The caller's usage |
//!
//! ## Example
//!
//! ```no_run
//! use corvus_server::prelude::*;
//! use corvus_engine::prelude::*;
//! use corvus_sandbox_mock::MockRuntime;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::start(EngineConfig::default(), MockRuntime::default(), TracingMetrics).await?;
//! let services = CoreServices { engine, auth: DevAuth::default() };
//!
//! let app = CorvusServer::default().build(services);
//! # Ok(())
//! # }
//! ```

mod api;

pub mod auth;
pub mod server;
pub mod services;
pub mod state;

pub use api::ApiError;

pub mod prelude {
    pub use crate::ApiError;
    pub use crate::auth::*;
    pub use crate::server::*;
    pub use crate::services::*;
    pub use crate::state::*;
}
