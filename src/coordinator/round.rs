use std::collections::HashMap;

use crate::{
    common::{Metrics, ParticipantId, Weights},
    coordinator::error::CoordinatorError,
};

/// The result of a participant's local training.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub model_weights: Weights,
    /// Weight of this update during aggregation, typically the
    /// number of samples the participant trained on.
    pub aggregation_weight: u64,
    pub metrics: Metrics,
}

/// A training round: the participants selected for it and the
/// updates they submitted so far.
#[derive(Debug, Default)]
pub struct Round {
    participant_ids: Vec<ParticipantId>,
    updates: HashMap<ParticipantId, Update>,
}

impl Round {
    pub fn new(participant_ids: Vec<ParticipantId>) -> Self {
        Self {
            participant_ids,
            updates: HashMap::new(),
        }
    }

    /// The participants selected for this round.
    pub fn participant_ids(&self) -> &[ParticipantId] {
        &self.participant_ids
    }

    pub fn is_selected(&self, participant_id: &ParticipantId) -> bool {
        self.participant_ids.contains(participant_id)
    }

    pub fn has_update(&self, participant_id: &ParticipantId) -> bool {
        self.updates.contains_key(participant_id)
    }

    /// Number of updates received so far.
    pub fn updates_count(&self) -> usize {
        self.updates.len()
    }

    /// Record the update of the given participant. Each participant
    /// can submit only one update per round: subsequent submissions
    /// are rejected and leave the round untouched.
    pub fn add_updates(
        &mut self,
        participant_id: ParticipantId,
        update: Update,
    ) -> Result<(), CoordinatorError> {
        if self.updates.contains_key(&participant_id) {
            return Err(CoordinatorError::DuplicatedUpdate(participant_id));
        }
        self.updates.insert(participant_id, update);
        Ok(())
    }

    /// Whether every selected participant submitted its update.
    pub fn is_finished(&self) -> bool {
        self.updates.len() == self.participant_ids.len()
    }

    /// Consume the round and return the submitted updates, in
    /// selection order.
    pub fn into_updates(self) -> Vec<(ParticipantId, Update)> {
        let Self {
            participant_ids,
            mut updates,
        } = self;
        participant_ids
            .into_iter()
            .filter_map(|id| updates.remove(&id).map(|update| (id, update)))
            .collect()
    }
}
