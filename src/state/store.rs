//! Keyed arena of step containers.
//!
//! Every container is obtained through this manager with an explicit
//! `(session_code, participant_id)` key; there is no process-wide state
//! container anywhere in this crate. Two different keys never share an
//! instance; repeated lookups for the same key always return the same one.
//!
//! Containers idle past a threshold are evicted by `sweep_idle`, which the
//! surrounding application calls periodically.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::card::GameStep;
use super::container::{ContainerError, StepContainer};

/// Default idle threshold before a container is eligible for eviction.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Composite identity of one participant's state within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub session_code: String,
    pub participant_id: String,
}

impl StoreKey {
    pub fn new(session_code: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            session_code: session_code.into(),
            participant_id: participant_id.into(),
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.session_code, self.participant_id)
    }
}

/// Store errors. Empty key parts are precondition violations, reported
/// before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    EmptyKey { field: &'static str },
    Container(ContainerError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKey { field } => write!(f, "Store key field '{}' is empty", field),
            Self::Container(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<ContainerError> for StoreError {
    fn from(err: ContainerError) -> Self {
        Self::Container(err)
    }
}

#[derive(Debug)]
struct StoreEntry {
    container: StepContainer,
    created_at: Instant,
    last_access: Instant,
}

/// Owns every live step container, keyed by composite identity.
#[derive(Debug)]
pub struct SessionStoreManager {
    stores: HashMap<StoreKey, StoreEntry>,
    idle_timeout: Duration,
}

impl Default for SessionStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStoreManager {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            stores: HashMap::new(),
            idle_timeout,
        }
    }

    /// Look up (or lazily create) the container for a key, refreshing its
    /// last-access time. Requesting the next step for an existing key
    /// advances the container in place; going backwards is an error.
    pub fn get_store(
        &mut self,
        session_code: &str,
        participant_id: &str,
        step: GameStep,
    ) -> Result<&mut StepContainer, StoreError> {
        if session_code.is_empty() {
            return Err(StoreError::EmptyKey { field: "session_code" });
        }
        if participant_id.is_empty() {
            return Err(StoreError::EmptyKey { field: "participant_id" });
        }

        let key = StoreKey::new(session_code, participant_id);
        let now = Instant::now();
        let entry = self.stores.entry(key).or_insert_with(|| StoreEntry {
            container: StepContainer::new(step),
            created_at: now,
            last_access: now,
        });
        entry.last_access = now;

        if entry.container.step() < step {
            entry.container.advance_to(step)?;
        } else if entry.container.step() > step {
            return Err(StoreError::Container(ContainerError::InvalidStepTransition {
                from: entry.container.step(),
                to: step,
            }));
        }
        Ok(&mut entry.container)
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.stores.contains_key(key)
    }

    /// Remove one container, cleaning it up first.
    pub fn remove(&mut self, key: &StoreKey) -> bool {
        match self.stores.remove(key) {
            Some(mut entry) => {
                entry.container.cleanup();
                true
            }
            None => false,
        }
    }

    /// Remove every container belonging to a session. Returns how many were
    /// evicted.
    pub fn remove_session(&mut self, session_code: &str) -> usize {
        let keys: Vec<StoreKey> = self
            .stores
            .keys()
            .filter(|k| k.session_code == session_code)
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    /// Evict containers idle past the threshold. Returns the evicted keys.
    pub fn sweep_idle(&mut self) -> Vec<StoreKey> {
        let now = Instant::now();
        let idle: Vec<StoreKey> = self
            .stores
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) >= self.idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &idle {
            if self.remove(key) {
                tracing::debug!(
                    target: "cardsort.store",
                    key = %key,
                    "evicted idle container"
                );
            }
        }
        idle
    }

    /// Age of a container, if it exists.
    pub fn age(&self, key: &StoreKey) -> Option<Duration> {
        self.stores.get(key).map(|e| e.created_at.elapsed())
    }

    pub fn count(&self) -> usize {
        self.stores.len()
    }
}
