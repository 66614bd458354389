//! Outbound message queue
//!
//! Every message the agent sends goes through the [`Outbox`]. It stamps the
//! client id from the identity handle, encodes the envelope and queues the
//! frame for the WebSocket task. Frames queued while the transport is down are
//! written after the next successful open.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::protocol::ClientMessage;
use crate::error::SendError;
use crate::identity::IdentityHandle;

/// Default capacity of the outbound queue
pub const OUTBOUND_CAPACITY: usize = 256;

/// An encoded frame waiting to be written to the socket
#[derive(Debug)]
pub struct OutboundFrame {
    pub kind: &'static str,
    pub text: String,
    pub ack: oneshot::Sender<Result<(), String>>,
}

impl OutboundFrame {
    /// Report the write outcome to whoever holds the [`Delivery`]
    pub fn acknowledge(self, result: Result<(), String>) {
        let _ = self.ack.send(result);
    }
}

/// Handle for the write acknowledgment of one frame.
///
/// Dropping it is fine: the frame is still sent.
#[derive(Debug)]
pub struct Delivery {
    kind: &'static str,
    rx: oneshot::Receiver<Result<(), String>>,
}

impl Delivery {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Wait until the frame has been written to the socket
    pub async fn confirmed(self) -> Result<(), SendError> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Delivery(e)),
            Err(_) => Err(SendError::Delivery("frame dropped before being written".to_string())),
        }
    }
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundFrame>,
    identity: IdentityHandle,
}

impl Outbox {
    /// Create an outbox and the receiving end consumed by the WebSocket task
    pub fn channel(identity: IdentityHandle, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, identity }, rx)
    }

    /// Queue a message. Rejected locally when there is no client id.
    pub fn send(&self, message: ClientMessage) -> Result<Delivery, SendError> {
        let kind = message.kind();
        let client_id = self.identity.get().ok_or_else(|| {
            warn!(kind, "Dropping outbound message, no client identity");
            SendError::MissingClientId
        })?;

        let text = message
            .to_frame(&client_id)
            .map_err(|e| SendError::Encode(e.to_string()))?;

        let (ack, rx) = oneshot::channel();
        self.tx
            .try_send(OutboundFrame { kind, text, ack })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(kind, "Outbound queue full, message dropped");
                    SendError::Delivery("outbound queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })?;

        debug!(kind, "Queued outbound message");
        Ok(Delivery { kind, rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_send_stamps_client_id() {
        let (outbox, mut rx) = Outbox::channel(IdentityHandle::with_id("client_1"), 8);
        let delivery = outbox.send(ClientMessage::url_change("https://a.test/")).unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.kind, "url_change");
        let json: Value = serde_json::from_str(&frame.text).unwrap();
        assert_eq!(json["clientId"], "client_1");

        frame.acknowledge(Ok(()));
        assert!(delivery.confirmed().await.is_ok());
    }

    #[tokio::test]
    async fn test_send_without_identity_is_rejected() {
        let (outbox, mut rx) = Outbox::channel(IdentityHandle::new(), 8);
        let result = outbox.send(ClientMessage::heartbeat());

        assert_eq!(result.unwrap_err(), SendError::MissingClientId);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_write_is_observable() {
        let (outbox, mut rx) = Outbox::channel(IdentityHandle::with_id("client_1"), 8);
        let delivery = outbox.send(ClientMessage::heartbeat()).unwrap();

        rx.recv().await.unwrap().acknowledge(Err("broken pipe".to_string()));
        assert_eq!(
            delivery.confirmed().await.unwrap_err(),
            SendError::Delivery("broken pipe".to_string())
        );
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let (outbox, _rx) = Outbox::channel(IdentityHandle::with_id("client_1"), 1);
        outbox.send(ClientMessage::heartbeat()).unwrap();
        assert!(matches!(
            outbox.send(ClientMessage::heartbeat()),
            Err(SendError::Delivery(_))
        ));
    }
}
