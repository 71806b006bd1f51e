//! Login authentication.
//!
//! - [`authenticator`]: resolves password, macaroon and anonymous
//!   credentials to an entity ([`Authenticator`]).

pub mod authenticator;

pub use authenticator::{Authenticated, Authenticator, Clock};
