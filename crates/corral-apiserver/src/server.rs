//! TCP listener.
//!
//! [`ApiServer`] owns the listener and the shared [`ServerContext`]. Each
//! accepted connection is served on its own task while it holds a
//! connection permit, bounding concurrent connections at
//! `max_connections`. Shutdown is driven by a [`CancellationToken`]: the
//! accept loop stops, every connection is closed and torn down, and
//! [`ApiServer::run`] returns once the last one has finished.
//!
//! # Invariants
//!
//! - [INV-SV-001] At most `max_connections` connections are served at once;
//!   further clients wait in the listen backlog.
//! - [INV-SV-002] [`ApiServer::run`] returns only after every connection
//!   task has completed its teardown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::context::ServerContext;
use crate::protocol::connection_handler::serve_connection;
use crate::protocol::error::{ProtocolError, ProtocolResult};

/// The API server.
#[derive(Debug)]
pub struct ApiServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    connections: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl ApiServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Io`] if the address cannot be bound.
    pub async fn bind(address: SocketAddr, ctx: Arc<ServerContext>) -> ProtocolResult<Self> {
        let listener = TcpListener::bind(address).await?;
        let max_connections = ctx.settings().max_connections.max(1);
        Ok(Self {
            listener,
            ctx,
            connections: Arc::new(Semaphore::new(max_connections)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the token that stops the server when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the shared context.
    #[must_use]
    pub const fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Accepts connections until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] if the connection
    /// semaphore is closed underneath the server.
    pub async fn run(self) -> ProtocolResult<()> {
        let tracker = TaskTracker::new();
        info!(
            address = ?self.listener.local_addr().ok(),
            max_connections = self.ctx.settings().max_connections,
            login_rate_limit = self.ctx.login_limiter().limit(),
            "API server listening"
        );

        let result = loop {
            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break Ok(()),
                permit = Arc::clone(&self.connections).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(ProtocolError::ConnectionClosed),
                },
            };
            let (stream, peer) = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    },
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "failed to set TCP_NODELAY");
            }
            debug!(%peer, "connection accepted");

            let ctx = Arc::clone(&self.ctx);
            let shutdown = self.shutdown.clone();
            tracker.spawn(async move {
                let _permit = permit;
                serve_connection(ctx, stream, shutdown).await;
            });
        };

        info!(live = tracker.len(), "API server stopping, closing connections");
        self.shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        info!("API server stopped");
        result
    }
}
