//! Collaborator ports for log and profile data
//!
//! The engine reads events from the log store and account metadata from the
//! asset system through these traits. Both are read-only for a run.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

use crate::models::{sort_chronologically, AuthEvent, EvaluationWindow, UserProfile};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Log source error: {0}")]
    Logs(String),

    #[error("Profile source error: {0}")]
    Profiles(String),
}

#[async_trait]
pub trait AuthLogSource: Send + Sync {
    /// Users with at least one event inside `window`
    async fn users_in_window(&self, window: EvaluationWindow) -> Result<Vec<String>, SourceError>;

    /// One user's events inside `window`, in any order
    async fn events_for_user(
        &self,
        user: &str,
        window: EvaluationWindow,
    ) -> Result<Vec<AuthEvent>, SourceError>;
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// `None` when the asset system has no record of the user
    async fn profile(&self, user: &str) -> Result<Option<UserProfile>, SourceError>;
}

/// Events held in memory, grouped by user
#[derive(Debug, Clone, Default)]
pub struct InMemoryLogSource {
    events: BTreeMap<String, Vec<AuthEvent>>,
}

impl InMemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<I: IntoIterator<Item = AuthEvent>>(events: I) -> Self {
        let mut source = Self::new();
        source.extend(events);
        source
    }

    pub fn push(&mut self, event: AuthEvent) {
        self.events.entry(event.user.clone()).or_default().push(event);
    }

    pub fn extend<I: IntoIterator<Item = AuthEvent>>(&mut self, events: I) {
        for event in events {
            self.push(event);
        }
        for user_events in self.events.values_mut() {
            sort_chronologically(user_events);
        }
    }

    pub fn len(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl AuthLogSource for InMemoryLogSource {
    async fn users_in_window(&self, window: EvaluationWindow) -> Result<Vec<String>, SourceError> {
        let users: BTreeSet<&String> = self
            .events
            .iter()
            .filter(|(_, events)| events.iter().any(|e| window.contains(e.timestamp)))
            .map(|(user, _)| user)
            .collect();
        Ok(users.into_iter().cloned().collect())
    }

    async fn events_for_user(
        &self,
        user: &str,
        window: EvaluationWindow,
    ) -> Result<Vec<AuthEvent>, SourceError> {
        Ok(self
            .events
            .get(user)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| window.contains(e.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryProfileSource {
    profiles: HashMap<String, UserProfile>,
}

impl InMemoryProfileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles<I: IntoIterator<Item = UserProfile>>(profiles: I) -> Self {
        let mut source = Self::new();
        for profile in profiles {
            source.insert(profile);
        }
        source
    }

    pub fn insert(&mut self, profile: UserProfile) {
        self.profiles.insert(profile.user.clone(), profile);
    }
}

#[async_trait]
impl ProfileSource for InMemoryProfileSource {
    async fn profile(&self, user: &str) -> Result<Option<UserProfile>, SourceError> {
        Ok(self.profiles.get(user).cloned())
    }
}
