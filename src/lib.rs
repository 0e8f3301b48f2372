// src/lib.rs
//! Revision router: serves several deployed revisions of one web application side by
//! side, picking a backend per request from subdomain, query parameter or cookie, with
//! an HTTP API for moving traffic between revisions at runtime.

pub mod admin;
pub mod backend;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod failover;
pub mod metrics;
pub mod probe;
pub mod proxy;
pub mod resolve;
pub mod router;
pub mod tables;

/// Crate version, reported at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export types for easier usage
pub use backend::Backend;
pub use client::AdminClient;
pub use config::{load_config, RouterConfig};
pub use error::{Result, RouterError};
pub use resolve::{Resolution, Resolver, RoutingHints};
pub use router::Router;
pub use tables::{RoutingTables, Table, STABLE_VERSION};
