//! Asynchronous notifications.
//!
//! Server-side resources push notifications through a [`Notifier`]. The
//! notifier feeds the same outbound queue as call responses, so a client
//! sees responses and notifications in the order the server produced them.

use serde_json::Value;
use tokio::sync::mpsc;

use super::error::ApiError;
use super::messages::ServerMessage;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Handle for pushing messages onto a connection's outbound stream.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<ServerMessage>,
}

impl Notifier {
    /// Creates a notifier and the receiving end drained by the writer task.
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Queues a notification from resource `resource_id` of `facade`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] if the connection has closed.
    pub async fn notify(
        &self,
        facade: &str,
        resource_id: &str,
        payload: Value,
    ) -> Result<(), ApiError> {
        self.send(ServerMessage::Notification {
            facade: facade.to_string(),
            resource_id: resource_id.to_string(),
            payload,
        })
        .await
    }

    /// Queues any server message.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] if the connection has closed.
    pub async fn send(&self, message: ServerMessage) -> Result<(), ApiError> {
        self.tx.send(message).await.map_err(|_| ApiError::Cancelled)
    }

    /// Returns `true` once the connection's writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_notifications_share_the_outbound_queue() {
        let (notifier, mut rx) = Notifier::channel();
        notifier
            .send(ServerMessage::response(1, Ok(Value::Null)))
            .await
            .unwrap();
        notifier
            .notify("StatusWatcher", "1", json!({"changes": ["machine-0"]}))
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Response { request_id: 1, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::Notification { ref resource_id, .. }) if resource_id == "1"
        ));
    }

    #[tokio::test]
    async fn test_closed_connection_reports_cancelled() {
        let (notifier, rx) = Notifier::channel();
        drop(rx);
        assert!(notifier.is_closed());
        assert_eq!(
            notifier.notify("StatusWatcher", "1", Value::Null).await,
            Err(ApiError::Cancelled)
        );
    }
}
