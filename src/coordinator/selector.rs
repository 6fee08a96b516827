use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::common::ParticipantId;

/// Strategy used to choose the participants of a training round.
pub trait Selector {
    /// Choose `count` participants among `candidates`. `count` is
    /// never larger than the number of candidates.
    fn select(&mut self, count: usize, candidates: Vec<ParticipantId>) -> Vec<ParticipantId>;

    /// Select a `fraction` of the given participants. See
    /// [`number_of_ids_to_select`] for the number of participants
    /// returned.
    fn select_ids(
        &mut self,
        participant_ids: Vec<ParticipantId>,
        fraction: f64,
    ) -> Vec<ParticipantId> {
        let count = number_of_ids_to_select(participant_ids.len(), fraction);
        let mut selected = self.select(count, participant_ids);
        selected.truncate(count);
        selected
    }
}

impl<S: Selector + ?Sized> Selector for Box<S> {
    fn select(&mut self, count: usize, candidates: Vec<ParticipantId>) -> Vec<ParticipantId> {
        (**self).select(count, candidates)
    }
}

/// Number of participants to select among `total` so that roughly a
/// `fraction` of them take part to a round, but always at least one.
pub fn number_of_ids_to_select(total: usize, fraction: f64) -> usize {
    let raw = (total as f64 * fraction).ceil() as usize;
    total.min(raw.max(1))
}

/// Sample participants uniformly at random, without replacement.
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Return a selector that always makes the same choices for the
    /// same candidates.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RandomSelector {
    fn select(&mut self, count: usize, mut candidates: Vec<ParticipantId>) -> Vec<ParticipantId> {
        // the candidates usually come out of a hash map
        candidates.sort();
        let (selected, _) = candidates.partial_shuffle(&mut self.rng, count);
        selected.to_vec()
    }
}

/// Select the first participants in lexicographic order.
#[derive(Debug, Default)]
pub struct OrderSelector;

impl Selector for OrderSelector {
    fn select(&mut self, count: usize, mut candidates: Vec<ParticipantId>) -> Vec<ParticipantId> {
        candidates.sort();
        candidates.truncate(count);
        candidates
    }
}
