//! corral-apiserver - client-facing control plane of the corral controller.
//!
//! Accepts RPC connections from administrative clients and machine agents,
//! authenticates them, negotiates a versioned Admin facade, and routes every
//! later call through a dispatcher gated by the controller's mode.
//!
//! # Modules
//!
//! - [`auth`]: credential authentication (password, macaroon, anonymous)
//! - [`context`]: process-wide state shared by every connection
//! - [`facades`]: built-in facades (`Pinger`, `Client`, `StatusWatcher`,
//!   `Backups`)
//! - [`protocol`]: framing, sessions, restrictions and dispatch
//! - [`server`]: TCP listener with connection limit and shutdown

pub mod auth;
pub mod context;
pub mod facades;
pub mod protocol;
pub mod server;

pub use context::{ServerContext, ServerSettings};
pub use server::ApiServer;
