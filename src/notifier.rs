//! Notification sink
//!
//! The core never delivers notifications itself; it hands fully-formed
//! requests to a sink, fire-and-forget, only after its own state is
//! committed. A sink failure is logged and ignored; it never rolls back a
//! ledger transaction.

use crate::ExchangeResult;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// What happened, from the recipient's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Someone expressed interest in your service
    InterestReceived,
    /// Your request was approved and hours were escrowed
    RequestApproved,
    /// Your request was declined
    RequestDenied,
    /// The escrowed hour amount was re-negotiated
    HoursAdjusted,
    /// Both parties confirmed; the exchange settled
    HandshakeCompleted,
    /// The handshake was called off
    HandshakeCancelled,
    /// The other party filed a report
    HandshakeReported,
}

/// One notification request, emitted after commit
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub recipient: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub handshake_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
}

/// Delivery collaborator interface
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Accept one notification request. The caller ignores failures.
    async fn notify(&self, request: NotificationRequest) -> ExchangeResult<()>;
}

/// Default sink: writes the request to the log and drops it
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, request: NotificationRequest) -> ExchangeResult<()> {
        info!(
            "notification for {}: [{:?}] {}",
            request.recipient, request.kind, request.title
        );
        Ok(())
    }
}

/// Test sink: forwards every request over an unbounded channel
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotificationRequest>,
}

impl ChannelNotifier {
    /// Create the sink and the receiving end
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotificationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelNotifier {
    async fn notify(&self, request: NotificationRequest) -> ExchangeResult<()> {
        // a dropped receiver is not the core's problem
        let _ = self.tx.send(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_notifier_forwards_requests() {
        let (sink, mut rx) = ChannelNotifier::new();
        sink.notify(NotificationRequest {
            recipient: Uuid::new_v4(),
            kind: NotificationKind::InterestReceived,
            title: "New interest".to_string(),
            body: "Someone wants your help".to_string(),
            handshake_id: None,
            service_id: None,
            metadata: None,
        })
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, NotificationKind::InterestReceived);
    }

    #[tokio::test]
    async fn channel_notifier_survives_a_dropped_receiver() {
        let (sink, rx) = ChannelNotifier::new();
        drop(rx);
        let result = sink
            .notify(NotificationRequest {
                recipient: Uuid::new_v4(),
                kind: NotificationKind::HandshakeCompleted,
                title: "Done".to_string(),
                body: "All settled".to_string(),
                handshake_id: None,
                service_id: None,
                metadata: None,
            })
            .await;
        assert!(result.is_ok());
    }
}
