use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::time::Instant;

use crate::common::ParticipantId;

/// Default interval at which participants are expected to send
/// heartbeats.
pub const DEFAULT_HEARTBEAT_TIME: Duration = Duration::from_secs(10);

/// Default grace period after which a participant that missed its
/// heartbeat is considered gone.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the registry knows about a connected participant.
#[derive(Debug, Clone)]
pub struct ParticipantContext {
    pub participant_id: ParticipantId,
    /// Point in time after which the participant is evicted unless
    /// it sends a heartbeat.
    pub heartbeat_expires: Instant,
}

/// The participants connected to the coordinator.
///
/// Each method is atomic on its own, but two calls are not atomic
/// together: the registry can be modified by the heartbeat monitor
/// between them.
#[derive(Debug)]
pub struct ParticipantRegistry {
    participants: Mutex<HashMap<ParticipantId, ParticipantContext>>,
    heartbeat_time: Duration,
    heartbeat_timeout: Duration,
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIME, DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

impl ParticipantRegistry {
    pub fn new(heartbeat_time: Duration, heartbeat_timeout: Duration) -> Self {
        Self {
            participants: Mutex::new(HashMap::new()),
            heartbeat_time,
            heartbeat_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ParticipantId, ParticipantContext>> {
        // The map is never left half-updated, so a poisoned lock is
        // still safe to use.
        self.participants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expires_from(&self, now: Instant) -> Instant {
        now + self.heartbeat_time + self.heartbeat_timeout
    }

    /// Add a participant. If it is already registered, its heartbeat
    /// expiration is reset.
    pub fn add(&self, participant_id: ParticipantId) {
        let heartbeat_expires = self.expires_from(Instant::now());
        self.lock().insert(
            participant_id.clone(),
            ParticipantContext {
                participant_id,
                heartbeat_expires,
            },
        );
    }

    /// Remove a participant. Return whether it was registered.
    pub fn remove(&self, participant_id: &ParticipantId) -> bool {
        self.lock().remove(participant_id).is_some()
    }

    pub fn contains(&self, participant_id: &ParticipantId) -> bool {
        self.lock().contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Return the ids of all the registered participants, in no
    /// particular order.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.lock().keys().cloned().collect()
    }

    pub fn get(&self, participant_id: &ParticipantId) -> Option<ParticipantContext> {
        self.lock().get(participant_id).cloned()
    }

    /// Push the heartbeat expiration of the given participant
    /// forward. Return `false` if the participant is not registered.
    pub fn update_expires(&self, participant_id: &ParticipantId) -> bool {
        let heartbeat_expires = self.expires_from(Instant::now());
        match self.lock().get_mut(participant_id) {
            Some(context) => {
                context.heartbeat_expires = heartbeat_expires;
                true
            }
            None => false,
        }
    }

    /// Remove a participant if its heartbeat expired at `now`. Return
    /// whether it was removed.
    pub fn remove_if_expired(&self, participant_id: &ParticipantId, now: Instant) -> bool {
        let mut participants = self.lock();
        match participants.get(participant_id) {
            Some(context) if context.heartbeat_expires <= now => {
                participants.remove(participant_id);
                true
            }
            _ => false,
        }
    }

    /// Return the earliest heartbeat expiration, or the expiration a
    /// newly added participant would get if the registry is empty.
    pub fn next_expiration(&self) -> Instant {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|context| context.heartbeat_expires)
            .min()
            .unwrap_or_else(|| self.expires_from(now))
    }

    /// Return the participants whose heartbeat expired at `now`.
    pub fn expired(&self, now: Instant) -> Vec<ParticipantId> {
        self.lock()
            .values()
            .filter(|context| context.heartbeat_expires <= now)
            .map(|context| context.participant_id.clone())
            .collect()
    }
}
