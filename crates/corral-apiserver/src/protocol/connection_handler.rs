//! Connection handler.
//!
//! [`serve_connection`] drives one accepted transport from first frame to
//! teardown:
//!
//! ```text
//!   reader ──► Session::handle ──► Notifier ──► writer task ──► transport
//!                                     ▲
//!          resource notifications ────┘
//! ```
//!
//! Requests are processed one at a time. Responses and asynchronous
//! notifications share one outbound queue drained by a dedicated writer
//! task, so the client sees them in the order the server produced them.
//!
//! # Teardown
//!
//! The connection ends when the client closes the transport, a frame fails
//! to decode at the framing layer, the liveness monitor fires, or the
//! server shuts down. In every case the connection token is cancelled, the
//! liveness timers are stopped, every resource in the session's registry
//! is stopped, and the writer is flushed and joined.
//!
//! # Security Considerations
//!
//! - Frame size is bounded by the codec before allocation.
//! - A panicking facade method is isolated: it produces an opaque
//!   `internal` response and the session continues. A panic during login
//!   tears the connection down instead, since the session's authentication
//!   state can no longer be trusted.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::admin::ADMIN_FACADE;
use super::error::{ApiError, ProtocolError};
use super::liveness::LivenessMonitor;
use super::messages::{Request, ServerMessage, frame_codec, salvage_request_id};
use super::notifier::Notifier;
use super::session::Session;
use crate::context::ServerContext;

/// How long teardown waits for queued messages to reach the client.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type FrameSink<T> = SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>;

/// Serves one connection until it closes.
///
/// `shutdown` is the server's token; cancelling it closes the connection.
pub async fn serve_connection<T>(ctx: Arc<ServerContext>, io: T, shutdown: CancellationToken)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = ctx.next_connection_id();
    let cancel = shutdown.child_token();
    let (sink, mut stream) = Framed::new(io, frame_codec()).split();
    let (notifier, outbound) = Notifier::channel();
    let writer = tokio::spawn(write_loop(sink, outbound, cancel.clone(), connection_id));

    let settings = ctx.settings();
    let mut liveness = LivenessMonitor::start(
        &cancel,
        settings.client_ping_interval,
        Arc::clone(ctx.store()),
        settings.store_ping_interval,
    );
    let mut session = Session::new(Arc::clone(&ctx), connection_id, cancel.clone(), notifier.clone());
    info!(connection_id, "connection opened");

    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let e = ProtocolError::from_codec(e);
                if e.is_protocol_violation() {
                    warn!(connection_id, error = %e, "protocol violation, closing connection");
                } else {
                    debug!(connection_id, error = %e, "transport read failed");
                }
                break;
            },
            None => break,
        };
        liveness.touch();

        let request = match Request::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                let request_id = salvage_request_id(&frame);
                debug!(connection_id, request_id, error = %e, "malformed request");
                let response = ServerMessage::response(request_id, Err(ApiError::bad_request(e.to_string())));
                if notifier.send(response).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let request_id = request.request_id;
        let is_admin = request.facade == ADMIN_FACADE;
        debug!(
            connection_id,
            request_id,
            facade = %request.facade,
            version = request.version,
            method = %request.method,
            "request"
        );
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = AssertUnwindSafe(session.handle(request)).catch_unwind() => outcome,
        };

        let (result, fatal) = match outcome {
            Ok(result) => (result, false),
            Err(panic) => {
                error!(
                    connection_id,
                    request_id,
                    panic = panic_message(panic.as_ref()),
                    "request handler panicked"
                );
                (Err(ApiError::internal("request handler panicked")), is_admin)
            },
        };
        log_outcome(connection_id, request_id, &result);
        if notifier.send(ServerMessage::response(request_id, result)).await.is_err() || fatal {
            break;
        }
    }

    cancel.cancel();
    liveness.stop().await;
    let failures = session.close().await;
    drop(session);
    drop(notifier);
    if let Err(e) = writer.await {
        error!(connection_id, error = %e, "writer task failed");
    }
    info!(connection_id, failed_resource_stops = failures, "connection closed");
}

async fn write_loop<T>(
    mut sink: FrameSink<T>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
    connection_id: u64,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = outbound.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        let send = send_message(&mut sink, &message);
        tokio::pin!(send);
        let mut interrupted = false;
        let sent = tokio::select! {
            biased;
            sent = &mut send => sent,
            () = cancel.cancelled() => {
                interrupted = true;
                Ok(())
            },
        };
        let sent = if interrupted {
            // A frame may be half written; finish it before anything else
            // goes on the wire, or write nothing more.
            match tokio::time::timeout(FLUSH_TIMEOUT, &mut send).await {
                Ok(sent) => sent,
                Err(_) => {
                    debug!(connection_id, "in-flight frame abandoned on close");
                    return;
                },
            }
        } else {
            sent
        };
        if let Err(e) = sent {
            debug!(connection_id, error = %e, "transport write failed");
            cancel.cancel();
            return;
        }
        if interrupted {
            break;
        }
    }

    // Flush whatever was queued before teardown, bounded in time.
    outbound.close();
    let flush = async {
        while let Ok(message) = outbound.try_recv() {
            send_message(&mut sink, &message).await?;
        }
        sink.close().await.map_err(ProtocolError::from_codec)
    };
    match tokio::time::timeout(FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => debug!(connection_id, error = %e, "flush on close failed"),
        Err(_) => debug!(connection_id, "flush on close timed out"),
    }
}

async fn send_message<T>(sink: &mut FrameSink<T>, message: &ServerMessage) -> Result<(), ProtocolError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    sink.send(frame).await.map_err(ProtocolError::from_codec)
}

fn log_outcome(connection_id: u64, request_id: u64, result: &Result<serde_json::Value, ApiError>) {
    match result {
        Ok(_) => debug!(connection_id, request_id, "response ok"),
        Err(ApiError::Internal { detail }) => {
            error!(connection_id, request_id, %detail, "internal error");
        },
        Err(e) => debug!(connection_id, request_id, code = e.code(), "response error"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}
