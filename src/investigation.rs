//! Investigation state tracker
//!
//! Owns the `none -> open -> investigated -> none` lifecycle of each user.
//! Expiry is lazy: an investigated record stops suppressing once the
//! evaluation time reaches its suppress-until instant, whether or not the
//! record has been pruned yet.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::config::InvestigationConfig;
use crate::hooks::{EventQueue, HookError, InvestigationEvent, TicketHook};
use crate::models::{InvestigationRecord, InvestigationStatus};
use crate::persistence::{InvestigationStore, PersistenceError};

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Investigation store error: {0}")]
    Store(#[from] PersistenceError),

    #[error("Invalid user identifier: {0:?}")]
    InvalidUser(String),
}

pub struct InvestigationTracker {
    store: Arc<dyn InvestigationStore>,
    suppression: Duration,
    events: Option<EventQueue>,
}

impl InvestigationTracker {
    pub fn new(store: Arc<dyn InvestigationStore>, suppression: Duration) -> Self {
        InvestigationTracker {
            store,
            suppression,
            events: None,
        }
    }

    pub fn from_config(store: Arc<dyn InvestigationStore>, config: &InvestigationConfig) -> Self {
        Self::new(store, config.suppression())
    }

    /// Publish every transition on `queue`
    pub fn with_events(mut self, queue: EventQueue) -> Self {
        self.events = Some(queue);
        self
    }

    pub fn suppression(&self) -> Duration {
        self.suppression
    }

    pub fn store(&self) -> &Arc<dyn InvestigationStore> {
        &self.store
    }

    fn publish(&self, event: InvestigationEvent) {
        if let Some(queue) = &self.events {
            queue.queue_event(event);
        }
    }

    fn check_user(user: &str) -> Result<(), TrackerError> {
        if user.trim().is_empty() {
            return Err(TrackerError::InvalidUser(user.to_string()));
        }
        Ok(())
    }

    /// Record that an analyst investigated `user` at `at`
    ///
    /// Suppresses the user until `at` plus the suppression period. Marking
    /// again overwrites the previous mark.
    pub fn mark_investigated(
        &self,
        user: &str,
        at: DateTime<Utc>,
    ) -> Result<InvestigationRecord, TrackerError> {
        Self::check_user(user)?;
        let suppression = self.suppression;

        let mut mark = |current: Option<InvestigationRecord>| {
            let mut next = InvestigationRecord::investigated(user, at, suppression);
            next.opened_at = current.and_then(|c| c.opened_at);
            Some(next)
        };
        let stored = self.store.update_record(user, &mut mark)?;

        let record = stored.ok_or_else(|| {
            PersistenceError::InvalidData(format!("mark for '{}' was not stored", user))
        })?;
        let suppress_until = record.suppress_until.unwrap_or(at + suppression);
        log::info!(
            "Marked '{}' investigated at {}, suppressed until {}",
            user,
            at.to_rfc3339(),
            suppress_until.to_rfc3339()
        );
        self.publish(InvestigationEvent::MarkedInvestigated {
            user: user.to_string(),
            at: record.marked_at.unwrap_or(at),
            suppress_until,
        });
        Ok(record)
    }

    /// Move `user` from none to open
    ///
    /// An already open ticket keeps its original open time and an active
    /// investigation is left untouched. An expired investigation reopens.
    pub fn open_ticket(
        &self,
        user: &str,
        at: DateTime<Utc>,
    ) -> Result<InvestigationRecord, TrackerError> {
        Self::check_user(user)?;
        let mut opened = false;

        let mut open = |current: Option<InvestigationRecord>| match current {
            Some(record) if record.effective_status(at) != InvestigationStatus::None => {
                opened = false;
                Some(record)
            }
            _ => {
                opened = true;
                Some(InvestigationRecord::opened(user, at))
            }
        };
        let stored = self.store.update_record(user, &mut open)?;

        let record = stored.ok_or_else(|| {
            PersistenceError::InvalidData(format!("ticket for '{}' was not stored", user))
        })?;
        if opened {
            log::info!("Ticket opened for '{}' at {}", user, at.to_rfc3339());
            self.publish(InvestigationEvent::TicketOpened {
                user: user.to_string(),
                at,
            });
        } else {
            log::debug!(
                "Ticket for '{}' ignored, record already {}",
                user,
                record.effective_status(at)
            );
        }
        Ok(record)
    }

    /// Withdraw any mark or ticket for `user`; returns whether a record existed
    pub fn clear(&self, user: &str, at: DateTime<Utc>) -> Result<bool, TrackerError> {
        Self::check_user(user)?;
        let existed = self.store.delete_record(user)?;
        if existed {
            log::info!("Cleared investigation state for '{}'", user);
            self.publish(InvestigationEvent::Cleared {
                user: user.to_string(),
                at,
            });
        }
        Ok(existed)
    }

    pub fn record(&self, user: &str) -> Result<Option<InvestigationRecord>, TrackerError> {
        Ok(self.store.get_record(user)?)
    }

    pub fn status(
        &self,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<InvestigationStatus, TrackerError> {
        Ok(self
            .record(user)?
            .map(|r| r.effective_status(now))
            .unwrap_or(InvestigationStatus::None))
    }

    /// Whether `user` must be left out of output produced at `now`
    pub fn is_suppressed(&self, user: &str, now: DateTime<Utc>) -> Result<bool, TrackerError> {
        Ok(self
            .record(user)?
            .map(|r| r.is_suppressed(now))
            .unwrap_or(false))
    }

    /// Records still suppressing at `now`, by user
    pub fn active_suppressions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InvestigationRecord>, TrackerError> {
        Ok(self
            .store
            .list_records()?
            .into_iter()
            .filter(|r| r.is_suppressed(now))
            .collect())
    }

    /// Physically delete records whose suppression has ended
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize, TrackerError> {
        let pruned = self.store.prune_expired(now)?;
        if pruned > 0 {
            log::info!("Pruned {} expired investigation record(s)", pruned);
        }
        Ok(pruned)
    }
}

impl TicketHook for InvestigationTracker {
    fn ticket_created(&self, user: &str, at: DateTime<Utc>) -> Result<(), HookError> {
        self.open_ticket(user, at)
            .map(|_| ())
            .map_err(|e| HookError::Rejected(e.to_string()))
    }
}
