//! Core domain types for the corral controller.
//!
//! This crate holds everything the API server needs that is independent of
//! the RPC transport:
//!
//! - [`tag`]: typed entity tags (`user-…`, `machine-…`, …)
//! - [`mode`]: the process-wide controller lifecycle mode
//! - [`credentials`]: password hashes, macaroons and third-party discharges
//! - [`state`]: the cluster-state store collaborator
//! - [`config`]: TOML configuration for the API server

pub mod config;
pub mod credentials;
pub mod mode;
pub mod state;
pub mod tag;

pub use mode::{ControllerMode, ModeSink, ModeSource, SharedControllerMode};
pub use tag::{Tag, TagError, TagKind};
