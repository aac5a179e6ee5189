//! Hooks for the ticketing system
//!
//! The ticketing system reports ticket creation through [`TicketHook`].
//! Every investigation state transition is also published as an
//! [`InvestigationEvent`] on an optional bounded queue, so a reporting layer
//! can follow what analysts and the ticketing system did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the investigation event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Errors that can occur in hook handling
#[derive(Error, Debug)]
pub enum HookError {
    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Hook rejected: {0}")]
    Rejected(String),
}

/// Called by the ticketing system when it opens a ticket for a user
pub trait TicketHook: Send + Sync {
    fn ticket_created(&self, user: &str, at: DateTime<Utc>) -> Result<(), HookError>;
}

/// A transition of a user's investigation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InvestigationEvent {
    TicketOpened {
        user: String,
        at: DateTime<Utc>,
    },
    MarkedInvestigated {
        user: String,
        at: DateTime<Utc>,
        suppress_until: DateTime<Utc>,
    },
    Cleared {
        user: String,
        at: DateTime<Utc>,
    },
}

impl InvestigationEvent {
    pub fn user(&self) -> &str {
        match self {
            InvestigationEvent::TicketOpened { user, .. }
            | InvestigationEvent::MarkedInvestigated { user, .. }
            | InvestigationEvent::Cleared { user, .. } => user,
        }
    }
}

/// Create a sender/receiver pair for investigation events
pub fn create_channel() -> (
    mpsc::Sender<InvestigationEvent>,
    mpsc::Receiver<InvestigationEvent>,
) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Sync-friendly publisher of investigation events
///
/// Publishing never blocks the caller. If the queue is full or nobody is
/// listening, the event is dropped and a warning logged.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<InvestigationEvent>,
}

impl EventQueue {
    pub fn new(tx: mpsc::Sender<InvestigationEvent>) -> Self {
        EventQueue { tx }
    }

    /// Queue an event (non-blocking)
    pub fn queue_event(&self, event: InvestigationEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    log::warn!(
                        "Investigation event queue full, dropping event for '{}'",
                        event.user()
                    );
                }
                mpsc::error::TrySendError::Closed(_) => {
                    log::warn!("Investigation event queue closed");
                }
            }
        }
    }

    /// Queue an event (async version)
    pub async fn queue_event_async(&self, event: InvestigationEvent) -> Result<(), HookError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| HookError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn opened(user: &str) -> InvestigationEvent {
        InvestigationEvent::TicketOpened {
            user: user.to_string(),
            at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_event_queue_send() {
        let (tx, mut rx) = create_channel();
        let queue = EventQueue::new(tx);
        assert!(!queue.is_closed());

        queue.queue_event(opened("v"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.user(), "v");
    }

    #[tokio::test]
    async fn test_event_queue_async_send() {
        let (tx, mut rx) = create_channel();
        let queue = EventQueue::new(tx);

        queue.queue_event_async(opened("v")).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let queue = EventQueue::new(tx);

        queue.queue_event(opened("first"));
        queue.queue_event(opened("second"));

        assert_eq!(rx.recv().await.unwrap().user(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (tx, rx) = create_channel();
        let queue = EventQueue::new(tx);
        drop(rx);

        assert!(queue.is_closed());
        queue.queue_event(opened("v"));
        assert!(matches!(
            queue.queue_event_async(opened("v")).await,
            Err(HookError::ChannelClosed)
        ));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(opened("v")).unwrap();
        assert_eq!(json["event"], "ticket_opened");
        assert_eq!(json["user"], "v");
    }
}
