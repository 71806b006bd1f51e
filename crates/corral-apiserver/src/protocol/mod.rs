//! RPC protocol and dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Facades (Pinger, Client, ...)     │  facades
//! ├─────────────────────────────────────────┤
//! │   Root dispatcher + restriction chain    │  root, restrictions
//! ├─────────────────────────────────────────┤
//! │        Session (Admin.Login)             │  session, admin
//! ├─────────────────────────────────────────┤
//! │  Connection (liveness, resources, I/O)   │  connection_handler
//! ├─────────────────────────────────────────┤
//! │        Framing (length-prefixed JSON)    │  messages
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`admin`]: versioned login handlers ([`AdminFacadeRegistry`])
//! - [`connection_handler`]: per-connection read/dispatch/write loop
//! - [`error`]: [`ApiError`] (client-visible) and [`ProtocolError`]
//!   (transport)
//! - [`liveness`]: client ping timeout and store pinger
//! - [`messages`]: wire messages and the frame codec
//! - [`notifier`]: outbound queue shared by responses and notifications
//! - [`rate_limit`]: server-wide login semaphore
//! - [`resources`]: per-session resource registry
//! - [`restrictions`]: mode-gated allow lists
//! - [`root`]: facade registry and root dispatcher
//! - [`session`]: session state and login sequence
//!
//! # Wire Format
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! - Maximum frame size: 16 MiB
//! - Client to server: [`Request`]
//! - Server to client: [`ServerMessage`]
//!
//! # Security Considerations
//!
//! - Frame size validated before allocation
//! - Only `Admin.Login` is reachable before authentication
//! - Restrictions are evaluated before facade lookup

pub mod admin;
pub mod connection_handler;
pub mod error;
pub mod liveness;
pub mod messages;
pub mod notifier;
pub mod rate_limit;
pub mod resources;
pub mod restrictions;
pub mod root;
pub mod session;

pub use admin::{AdminFacadeRegistry, AdminHandler, LoginRequest, LoginResultV0, LoginResultV3};
pub use connection_handler::serve_connection;
pub use error::{ApiError, ErrorBody, MAX_FRAME_SIZE, ProtocolError, ProtocolResult};
pub use messages::{Request, ServerMessage, frame_codec};
pub use notifier::Notifier;
pub use resources::{Resource, ResourceError, ResourceRegistry};
pub use restrictions::RestrictionChain;
pub use root::{FacadeContext, FacadeRegistry, FacadeSpec, FacadeVersions, RootDispatcher};
pub use session::Session;
