//! `Pinger`: liveness probe. Reachable in every controller mode.

use std::sync::Arc;

use crate::protocol::error::ApiError;
use crate::protocol::root::{FacadeContext, FacadeSpec};

/// Facade name.
pub const NAME: &str = "Pinger";

/// The `Pinger` facade. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pinger;

impl Pinger {
    /// Answers a ping. Any call resets the connection's idle timer, so the
    /// method itself has nothing to do.
    #[allow(clippy::unused_async)]
    pub async fn ping(self: Arc<Self>, (): ()) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Builds `Pinger` version 1.
#[must_use]
pub fn facade() -> FacadeSpec {
    FacadeSpec::builder(NAME, 1, |_: &FacadeContext| Ok(Pinger))
        .method("Ping", Pinger::ping)
        .build()
}
