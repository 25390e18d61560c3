#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! livegate library: the connection layer for persistent browser sessions.
//!
//! The building blocks:
//! - `gate`: process-wide admission gate for new connections
//! - `sessions`: latent/active token registry and the session handle
//! - `ws`: websocket handshake and serve loop
//! - `reaper`: background expiry of idle sessions and stale uploads
//! - `uploads`: token-keyed upload rendezvous
//! - `assets`: weakly hosted temporary assets
//! - `crawler`: socket-less rendering for crawlers
//! - `app`: the application seam and the built-in page router
//! - `routes` / `server`: HTTP surface and lifecycle

pub mod app;
pub mod assets;
pub mod config;
pub mod crawler;
pub mod error;
pub mod gate;
pub mod reaper;
pub mod routes;
pub mod server;
pub mod sessions;
pub mod state;
pub mod uploads;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use app::{Application, StaticPages};
pub use config::Config;
pub use error::GateError;
pub use gate::ConnectionGate;
pub use sessions::SessionRegistry;
pub use state::AppState;
