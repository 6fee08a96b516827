use std::{collections::VecDeque, mem, sync::Arc};

use derive_more::Display;
use tokio::time::Instant;

use crate::{
    common::{Metrics, ParticipantId, Weights},
    coordinator::{
        aggregator::Aggregator,
        error::{CoordinatorError, InvalidConfig},
        models::{
            EndTrainingRoundRequest, EndTrainingRoundResponse, HeartbeatResponse, Message,
            RendezvousResponse, Response, StartTrainingRoundResponse, State,
        },
        participants::ParticipantRegistry,
        round::{Round, Update},
        selector::Selector,
    },
};

/// Parameters of a training session.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Number of rounds of the training session.
    pub num_rounds: u32,
    /// Number of epochs each participant trains for during a round.
    pub epochs_per_round: u32,
    /// Minimum number of participants selected for a round.
    pub minimum_participants_in_round: u32,
    /// Fraction of the connected participants selected for a round,
    /// in `(0, 1]`.
    pub fraction_of_participants: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            num_rounds: 1,
            epochs_per_round: 1,
            minimum_participants_in_round: 1,
            fraction_of_participants: 1.0,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.num_rounds < 1 {
            return Err(InvalidConfig("`num_rounds` must be at least 1".into()));
        }
        if self.minimum_participants_in_round < 1 {
            return Err(InvalidConfig(
                "`minimum_participants_in_round` must be at least 1".into(),
            ));
        }
        if !(self.fraction_of_participants > 0.0 && self.fraction_of_participants <= 1.0) {
            return Err(InvalidConfig(format!(
                "`fraction_of_participants` must be in (0, 1], got {}",
                self.fraction_of_participants
            )));
        }
        if self.epochs_per_round.checked_mul(self.num_rounds).is_none() {
            return Err(InvalidConfig(format!(
                "{} round(s) of {} epoch(s) overflow the epoch counter",
                self.num_rounds, self.epochs_per_round
            )));
        }
        Ok(())
    }

    /// Number of participants that must be connected for a round to
    /// start, so that selecting `fraction_of_participants` of them
    /// yields at least `minimum_participants_in_round` participants.
    pub fn minimum_connected_participants(&self) -> usize {
        let minimum = self.minimum_participants_in_round as f64;
        (minimum / self.fraction_of_participants).floor() as usize
    }
}

/// Side effects requested by the state machine. They are carried
/// out by the [`CoordinatorService`](crate::coordinator::CoordinatorService),
/// and their failure never affects the protocol.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum Event {
    /// Fetch the weights a participant uploaded for the given round.
    #[display(
        fmt = "read local weights of participant {} for round {}",
        participant_id,
        round
    )]
    ReadLocalWeights {
        participant_id: ParticipantId,
        round: u32,
    },

    /// Forward the metrics reported by a participant.
    #[display(fmt = "write metrics of participant {}", participant_id)]
    WriteMetrics {
        participant_id: ParticipantId,
        metrics: Metrics,
    },

    /// Persist the global weights resulting from the given round.
    #[display(fmt = "write global weights of round {}", round)]
    WriteGlobalWeights { round: u32, weights: Weights },
}

/// The coordinator state machine.
///
/// The coordinator starts in [`State::StandBy`] and waits for enough
/// participants to connect. It then selects the participants of the
/// first round and moves to [`State::Round`]. Each time all the
/// selected participants sent their update, the updates are
/// aggregated into new global weights and a new round starts, until
/// the last round after which the coordinator moves to
/// [`State::Finished`]. If too many participants disconnect during
/// a round, the round is abandoned and the coordinator goes back to
/// [`State::StandBy`]. A failed aggregation aborts the session.
pub struct Coordinator<A, S>
where
    A: Aggregator,
    S: Selector,
{
    config: CoordinatorConfig,
    minimum_connected_participants: usize,

    participants: Arc<ParticipantRegistry>,
    aggregator: A,
    selector: S,

    /// The global model
    global_weights: Weights,
    /// Number of epochs the global model has been trained for
    epoch_base: u32,

    round: Round,
    state: State,
    current_round: u32,

    /// Events emitted by the state machine
    events: VecDeque<Event>,
}

impl<A, S> Coordinator<A, S>
where
    A: Aggregator,
    S: Selector,
{
    pub fn new(
        config: CoordinatorConfig,
        aggregator: A,
        selector: S,
        participants: Arc<ParticipantRegistry>,
        global_weights: Weights,
    ) -> Result<Self, InvalidConfig> {
        config.validate()?;
        let minimum_connected_participants = config.minimum_connected_participants();
        info!(
            "new coordinator: {} round(s), waiting for {} participant(s)",
            config.num_rounds, minimum_connected_participants
        );
        Ok(Self {
            config,
            minimum_connected_participants,
            participants,
            aggregator,
            selector,
            global_weights,
            epoch_base: 0,
            round: Round::default(),
            state: State::StandBy,
            current_round: 0,
            events: VecDeque::new(),
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn epoch_base(&self) -> u32 {
        self.epoch_base
    }

    pub fn global_weights(&self) -> &Weights {
        &self.global_weights
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn minimum_connected_participants(&self) -> usize {
        self.minimum_connected_participants
    }

    pub fn participants(&self) -> &Arc<ParticipantRegistry> {
        &self.participants
    }

    /// Retrieve the next event
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn emit_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Handle a message from the given participant.
    ///
    /// Only rendez-vous requests are accepted from participants that
    /// are not registered. When a message is rejected, the state of
    /// the coordinator is left unchanged.
    pub fn on_message(
        &mut self,
        message: Message,
        participant_id: &ParticipantId,
    ) -> Result<Response, CoordinatorError> {
        debug!(
            "received {} message from participant {}",
            message.kind(),
            participant_id
        );
        match message {
            Message::Rendezvous => Ok(self.rendezvous(participant_id).into()),
            Message::Heartbeat => self.heartbeat(participant_id).map(Response::from),
            Message::StartTrainingRound => self
                .start_training_round(participant_id)
                .map(Response::from),
            Message::EndTrainingRound(request) => self
                .end_training_round(participant_id, request)
                .map(Response::from),
        }
    }

    fn check_registered(&self, participant_id: &ParticipantId) -> Result<(), CoordinatorError> {
        if self.participants.contains(participant_id) {
            Ok(())
        } else {
            Err(CoordinatorError::UnknownParticipant(participant_id.clone()))
        }
    }

    /// Handle a rendez-vous request. Participants are accepted until
    /// enough of them are connected to start a round. Once the quorum
    /// is reached every rendez-vous is answered with
    /// [`RendezvousResponse::Later`], including those of registered
    /// participants.
    pub fn rendezvous(&mut self, participant_id: &ParticipantId) -> RendezvousResponse {
        if self.participants.len() >= self.minimum_connected_participants {
            info!(
                "rejecting participant {}: {} participant(s) connected already",
                participant_id,
                self.participants.len()
            );
            return RendezvousResponse::Later;
        }

        if self.participants.contains(participant_id) {
            // The participant may have restarted without noticing it
            // had been accepted already.
            debug!("participant {} is already registered", participant_id);
            self.participants.update_expires(participant_id);
            return RendezvousResponse::Accept;
        }

        self.participants.add(participant_id.clone());
        let connected = self.participants.len();
        info!(
            "accepted participant {} ({}/{} connected)",
            participant_id, connected, self.minimum_connected_participants
        );

        if connected >= self.minimum_connected_participants && self.state == State::StandBy {
            self.select_participant_ids_and_init_round();
            self.state = State::Round;
        }
        RendezvousResponse::Accept
    }

    /// Handle a heartbeat. Participants that are not selected for the
    /// current round are told to stand by.
    pub fn heartbeat(
        &mut self,
        participant_id: &ParticipantId,
    ) -> Result<HeartbeatResponse, CoordinatorError> {
        self.check_registered(participant_id)?;
        self.participants.update_expires(participant_id);

        let state = match self.state {
            State::Round if !self.round.is_selected(participant_id) => State::StandBy,
            state => state,
        };
        trace!(
            "heartbeat from {}: {} (round {})",
            participant_id,
            state,
            self.current_round
        );
        Ok(HeartbeatResponse {
            state,
            round: self.current_round,
        })
    }

    /// Handle a start training request: return the global model to
    /// train on.
    pub fn start_training_round(
        &mut self,
        participant_id: &ParticipantId,
    ) -> Result<StartTrainingRoundResponse, CoordinatorError> {
        self.check_registered(participant_id)?;
        self.check_selected(participant_id, "start training")?;
        Ok(StartTrainingRoundResponse {
            weights: self.global_weights.clone(),
            epochs: self.config.epochs_per_round,
            epoch_base: self.epoch_base,
        })
    }

    /// Handle an end training request: record the participant's
    /// update and, if it was the last one, aggregate the updates and
    /// move on to the next round.
    ///
    /// The participant's metrics are only forwarded once its update
    /// made it into new global weights.
    pub fn end_training_round(
        &mut self,
        participant_id: &ParticipantId,
        request: EndTrainingRoundRequest,
    ) -> Result<EndTrainingRoundResponse, CoordinatorError> {
        self.check_registered(participant_id)?;
        self.check_selected(participant_id, "end training")?;

        let EndTrainingRoundRequest {
            weights,
            aggregation_weight,
            metrics,
        } = request;
        self.round.add_updates(
            participant_id.clone(),
            Update {
                model_weights: weights,
                aggregation_weight,
                metrics,
            },
        )?;
        info!(
            "round {}: received update from {} ({}/{})",
            self.current_round,
            participant_id,
            self.round.updates_count(),
            self.round.participant_ids().len()
        );

        self.emit_event(Event::ReadLocalWeights {
            participant_id: participant_id.clone(),
            round: self.current_round,
        });

        if self.round.is_finished() {
            self.complete_round()?;
        }
        Ok(EndTrainingRoundResponse {})
    }

    fn check_selected(
        &self,
        participant_id: &ParticipantId,
        request: &str,
    ) -> Result<(), CoordinatorError> {
        if self.state != State::Round {
            return Err(CoordinatorError::InvalidRequest(format!(
                "participant {} sent a {} request outside of a round",
                participant_id, request
            )));
        }
        if !self.round.is_selected(participant_id) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "participant {} sent a {} request but is not selected for round {}",
                participant_id, request, self.current_round
            )));
        }
        Ok(())
    }

    /// Aggregate the updates of the current round and start the next
    /// one, or finish the training session.
    ///
    /// If the aggregation fails the training session is aborted: the
    /// coordinator moves to [`State::Finished`] and the global model
    /// of the last completed round is kept.
    fn complete_round(&mut self) -> Result<(), CoordinatorError> {
        info!("running aggregation for round {}", self.current_round);
        let round = mem::take(&mut self.round);

        let mut metrics = Vec::new();
        let weight_updates = round
            .into_updates()
            .into_iter()
            .map(|(participant_id, update)| {
                metrics.push((participant_id, update.metrics));
                (update.model_weights, update.aggregation_weight)
            })
            .collect();
        match self.aggregator.aggregate(weight_updates) {
            Ok(weights) => self.global_weights = weights,
            Err(err) => {
                error!(
                    "aggregation failed for round {}, aborting the training session: {}",
                    self.current_round, err
                );
                self.state = State::Finished;
                return Err(err.into());
            }
        }
        for (participant_id, metrics) in metrics {
            self.emit_event(Event::WriteMetrics {
                participant_id,
                metrics,
            });
        }
        self.emit_event(Event::WriteGlobalWeights {
            round: self.current_round,
            weights: self.global_weights.clone(),
        });

        if self.current_round + 1 >= self.config.num_rounds {
            info!(
                "training session finished after {} round(s)",
                self.config.num_rounds
            );
            self.state = State::Finished;
        } else {
            self.current_round += 1;
            self.epoch_base += self.config.epochs_per_round;
            self.select_participant_ids_and_init_round();
        }
        Ok(())
    }

    fn select_participant_ids_and_init_round(&mut self) {
        let selected = self.selector.select_ids(
            self.participants.ids(),
            self.config.fraction_of_participants,
        );
        info!(
            "starting round {} with {} participant(s)",
            self.current_round,
            selected.len()
        );
        self.round = Round::new(selected);
    }

    /// Remove a participant. If not enough participants remain
    /// connected, the current round is abandoned and the coordinator
    /// goes back to standby.
    pub fn remove_participant(&mut self, participant_id: &ParticipantId) {
        if !self.participants.remove(participant_id) {
            debug!("participant {} is not registered", participant_id);
            return;
        }
        self.on_participant_removed(participant_id);
    }

    /// Remove a participant whose heartbeat expired at `now`. A
    /// participant that sent a heartbeat in the meantime is kept.
    /// Return whether the participant was removed.
    pub fn remove_expired_participant(
        &mut self,
        participant_id: &ParticipantId,
        now: Instant,
    ) -> bool {
        if !self.participants.remove_if_expired(participant_id, now) {
            debug!(
                "participant {} is not registered or sent a heartbeat",
                participant_id
            );
            return false;
        }
        self.on_participant_removed(participant_id);
        true
    }

    fn on_participant_removed(&mut self, participant_id: &ParticipantId) {
        let connected = self.participants.len();
        info!(
            "removed participant {} ({} connected)",
            participant_id, connected
        );

        if self.state == State::Round && connected < self.minimum_connected_participants {
            warn!(
                "not enough participants connected to continue round {}, going back to standby",
                self.current_round
            );
            self.state = State::StandBy;
            self.round = Round::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{
        aggregator::FederatedAveraging, error::AggregationError, selector::OrderSelector,
    };
    use ndarray::arr1;
    use std::time::Duration;

    type TestCoordinator = Coordinator<FederatedAveraging, OrderSelector>;

    fn coordinator(
        minimum_participants_in_round: u32,
        fraction_of_participants: f64,
        num_rounds: u32,
    ) -> TestCoordinator {
        let config = CoordinatorConfig {
            num_rounds,
            epochs_per_round: 2,
            minimum_participants_in_round,
            fraction_of_participants,
        };
        Coordinator::new(
            config,
            FederatedAveraging,
            OrderSelector,
            Arc::new(ParticipantRegistry::default()),
            vec![arr1(&[0.0f32]).into_dyn()],
        )
        .unwrap()
    }

    fn id(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    fn weights(value: f32) -> Weights {
        vec![arr1(&[value]).into_dyn()]
    }

    fn end_training(value: f32, aggregation_weight: u64) -> EndTrainingRoundRequest {
        EndTrainingRoundRequest {
            weights: weights(value),
            aggregation_weight,
            metrics: Metrics::new(),
        }
    }

    /// Snapshot of everything a rejected message must leave untouched
    fn snapshot(c: &TestCoordinator) -> (State, u32, u32, Weights, Vec<ParticipantId>, usize) {
        (
            c.state(),
            c.current_round(),
            c.epoch_base(),
            c.global_weights().clone(),
            c.round().participant_ids().to_vec(),
            c.round().updates_count(),
        )
    }

    fn drain_events(c: &mut TestCoordinator) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = c.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn minimum_connected_participants() {
        let cases = [
            (1, 1.0, 1),
            (2, 1.0, 2),
            (1, 0.5, 2),
            (3, 0.5, 6),
            (1, 0.3, 3),
            (2, 0.3, 6),
        ];
        for &(minimum, fraction, expected) in cases.iter() {
            let config = CoordinatorConfig {
                minimum_participants_in_round: minimum,
                fraction_of_participants: fraction,
                ..Default::default()
            };
            assert_eq!(config.minimum_connected_participants(), expected);
        }
    }

    #[test]
    fn invalid_config() {
        let invalid = [
            CoordinatorConfig {
                num_rounds: 0,
                ..Default::default()
            },
            CoordinatorConfig {
                minimum_participants_in_round: 0,
                ..Default::default()
            },
            CoordinatorConfig {
                fraction_of_participants: 0.0,
                ..Default::default()
            },
            CoordinatorConfig {
                fraction_of_participants: 1.5,
                ..Default::default()
            },
            CoordinatorConfig {
                fraction_of_participants: f64::NAN,
                ..Default::default()
            },
            CoordinatorConfig {
                num_rounds: 1 << 16,
                epochs_per_round: 1 << 16,
                ..Default::default()
            },
        ];
        for config in invalid.iter() {
            assert!(config.validate().is_err(), "{:?}", config);
        }
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn quorum_gating() {
        let mut c = coordinator(3, 1.0, 1);
        for (i, name) in ["p0", "p1", "p2", "p3", "p4"].iter().enumerate() {
            let expected = if i < 3 {
                RendezvousResponse::Accept
            } else {
                RendezvousResponse::Later
            };
            assert_eq!(c.state() == State::Round, i >= 3);
            let response = c.on_message(Message::Rendezvous, &id(name)).unwrap();
            assert_eq!(response, Response::Rendezvous(expected));
        }
        assert_eq!(c.participants().len(), 3);
        assert!(!c.participants().contains(&id("p3")));
        assert_eq!(c.state(), State::Round);
    }

    #[test]
    fn rendezvous_of_a_registered_participant() {
        let mut c = coordinator(2, 1.0, 1);
        assert_eq!(c.rendezvous(&id("p1")), RendezvousResponse::Accept);
        assert_eq!(c.rendezvous(&id("p1")), RendezvousResponse::Accept);
        assert_eq!(c.participants().len(), 1);
        assert_eq!(c.state(), State::StandBy);

        // once the quorum is reached, even registered participants
        // are told to come back later
        assert_eq!(c.rendezvous(&id("p2")), RendezvousResponse::Accept);
        assert_eq!(c.rendezvous(&id("p1")), RendezvousResponse::Later);
        assert_eq!(c.rendezvous(&id("p3")), RendezvousResponse::Later);
        assert_eq!(c.participants().len(), 2);
        assert!(c.participants().contains(&id("p1")));
        assert_eq!(c.round().participant_ids(), &[id("p1"), id("p2")][..]);
    }

    #[test]
    fn end_to_end_scenario() {
        let mut c = coordinator(2, 1.0, 2);
        let (p1, p2) = (id("p1"), id("p2"));

        assert_eq!(c.rendezvous(&p1), RendezvousResponse::Accept);
        assert_eq!(c.state(), State::StandBy);
        assert_eq!(c.rendezvous(&p2), RendezvousResponse::Accept);
        assert_eq!(c.state(), State::Round);
        assert_eq!(c.round().participant_ids(), &[p1.clone(), p2.clone()][..]);

        let start = c.start_training_round(&p1).unwrap();
        assert_eq!(start.weights, weights(0.0));
        assert_eq!((start.epochs, start.epoch_base), (2, 0));

        c.end_training_round(&p1, end_training(1.0, 5)).unwrap();
        assert_eq!(c.round().updates_count(), 1);
        assert_eq!(c.current_round(), 0);

        c.end_training_round(&p2, end_training(3.0, 5)).unwrap();
        assert_eq!(c.global_weights(), &weights(2.0));
        assert_eq!(c.current_round(), 1);
        assert_eq!(c.epoch_base(), 2);
        assert_eq!(c.state(), State::Round);
        assert_eq!(c.round().participant_ids(), &[p1.clone(), p2.clone()][..]);
        assert_eq!(c.round().updates_count(), 0);

        let start = c.start_training_round(&p2).unwrap();
        assert_eq!(start.weights, weights(2.0));
        assert_eq!(start.epoch_base, 2);

        c.end_training_round(&p2, end_training(4.0, 1)).unwrap();
        c.end_training_round(&p1, end_training(0.0, 3)).unwrap();
        assert_eq!(c.state(), State::Finished);
        assert_eq!(c.current_round(), 1);
        assert_eq!(c.global_weights(), &weights(1.0));
    }

    #[test]
    fn unknown_participant_is_rejected() {
        let mut c = coordinator(2, 1.0, 1);
        c.rendezvous(&id("p1"));
        c.rendezvous(&id("p2"));
        let before = snapshot(&c);

        let ghost = id("ghost");
        let messages = vec![
            Message::Heartbeat,
            Message::StartTrainingRound,
            Message::EndTrainingRound(end_training(1.0, 1)),
        ];
        for message in messages {
            let err = c.on_message(message, &ghost).unwrap_err();
            assert_eq!(err, CoordinatorError::UnknownParticipant(ghost.clone()));
            assert_eq!(snapshot(&c), before);
        }
        assert!(!c.participants().contains(&ghost));
        assert!(drain_events(&mut c).is_empty());
    }

    #[test]
    fn heartbeat_advertises_round_to_selected_participants_only() {
        // one participant out of two is selected
        let mut c = coordinator(1, 0.5, 1);
        let (a, b) = (id("a"), id("b"));

        c.rendezvous(&a);
        let response = c.heartbeat(&a).unwrap();
        assert_eq!(response.state, State::StandBy);

        c.rendezvous(&b);
        assert_eq!(c.state(), State::Round);
        assert_eq!(c.round().participant_ids(), &[a.clone()][..]);

        let response = c.heartbeat(&a).unwrap();
        assert_eq!((response.state, response.round), (State::Round, 0));
        let response = c.heartbeat(&b).unwrap();
        assert_eq!((response.state, response.round), (State::StandBy, 0));
    }

    #[test]
    fn start_training_requires_a_round_and_a_selection() {
        let mut c = coordinator(1, 0.5, 1);
        let (a, b) = (id("a"), id("b"));
        c.rendezvous(&a);

        match c.start_training_round(&a) {
            Err(CoordinatorError::InvalidRequest(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }

        c.rendezvous(&b);
        assert!(c.start_training_round(&a).is_ok());
        let before = snapshot(&c);
        match c.start_training_round(&b) {
            Err(CoordinatorError::InvalidRequest(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        match c.end_training_round(&b, end_training(1.0, 1)) {
            Err(CoordinatorError::InvalidRequest(_)) => {}
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(snapshot(&c), before);
    }

    #[test]
    fn duplicated_update_is_rejected() {
        let mut c = coordinator(2, 1.0, 1);
        let (p1, p2) = (id("p1"), id("p2"));
        c.rendezvous(&p1);
        c.rendezvous(&p2);

        c.end_training_round(&p1, end_training(1.0, 1)).unwrap();
        drain_events(&mut c);
        let before = snapshot(&c);

        let err = c.end_training_round(&p1, end_training(9.0, 1)).unwrap_err();
        assert_eq!(err, CoordinatorError::DuplicatedUpdate(p1.clone()));
        assert_eq!(snapshot(&c), before);
        assert!(drain_events(&mut c).is_empty());

        // the first submission stands
        c.end_training_round(&p2, end_training(3.0, 1)).unwrap();
        assert_eq!(c.global_weights(), &weights(2.0));
    }

    #[test]
    fn eviction_falls_back_to_standby() {
        let mut c = coordinator(2, 1.0, 3);
        let (p1, p2, p3) = (id("p1"), id("p2"), id("p3"));
        c.rendezvous(&p1);
        c.rendezvous(&p2);
        c.end_training_round(&p1, end_training(1.0, 1)).unwrap();
        assert_eq!(c.state(), State::Round);

        c.remove_participant(&p2);
        assert_eq!(c.state(), State::StandBy);
        assert!(c.round().participant_ids().is_empty());
        assert_eq!(c.heartbeat(&p1).unwrap().state, State::StandBy);
        assert!(c.start_training_round(&p1).is_err());

        // removing an unknown participant is a no-op
        c.remove_participant(&p2);
        assert_eq!(c.participants().len(), 1);

        // a new participant restores the quorum and a fresh round
        assert_eq!(c.rendezvous(&p3), RendezvousResponse::Accept);
        assert_eq!(c.state(), State::Round);
        assert_eq!(c.current_round(), 0);
        assert_eq!(c.round().participant_ids(), &[p1.clone(), p3.clone()][..]);
        assert_eq!(c.round().updates_count(), 0);
    }

    #[test]
    fn rounds_and_epochs_are_monotonic() {
        let num_rounds = 4;
        let mut c = coordinator(2, 1.0, num_rounds);
        let (p1, p2) = (id("p1"), id("p2"));
        c.rendezvous(&p1);
        c.rendezvous(&p2);

        for round in 0..num_rounds {
            assert_eq!(c.current_round(), round);
            assert_eq!(c.epoch_base(), round * 2);
            c.end_training_round(&p1, end_training(round as f32, 1)).unwrap();
            assert_eq!(c.current_round(), round);
            c.end_training_round(&p2, end_training(round as f32, 1)).unwrap();
        }
        assert_eq!(c.state(), State::Finished);
        assert_eq!(c.current_round(), num_rounds - 1);
        assert_eq!(c.epoch_base(), (num_rounds - 1) * 2);
    }

    #[test]
    fn finished_is_terminal() {
        let mut c = coordinator(1, 1.0, 1);
        let p1 = id("p1");
        c.rendezvous(&p1);
        c.end_training_round(&p1, end_training(5.0, 1)).unwrap();
        assert_eq!(c.state(), State::Finished);
        assert_eq!(c.global_weights(), &weights(5.0));

        assert_eq!(c.heartbeat(&p1).unwrap().state, State::Finished);
        assert!(c.start_training_round(&p1).is_err());
        assert!(c.end_training_round(&p1, end_training(1.0, 1)).is_err());

        c.remove_participant(&p1);
        assert_eq!(c.state(), State::Finished);
        assert_eq!(c.rendezvous(&id("p2")), RendezvousResponse::Accept);
        assert_eq!(c.state(), State::Finished);
        assert_eq!(c.heartbeat(&id("p2")).unwrap().state, State::Finished);
    }

    #[test]
    fn failed_aggregation_aborts_the_session() {
        let mut c = coordinator(2, 1.0, 3);
        let (p1, p2) = (id("p1"), id("p2"));
        c.rendezvous(&p1);
        c.rendezvous(&p2);
        c.end_training_round(&p1, end_training(1.0, 1)).unwrap();
        c.end_training_round(&p2, end_training(3.0, 1)).unwrap();
        drain_events(&mut c);

        c.end_training_round(&p1, end_training(1.0, 0)).unwrap();
        let err = c.end_training_round(&p2, end_training(3.0, 0)).unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::Aggregation(AggregationError::ZeroTotalWeight)
        );
        assert_eq!(c.state(), State::Finished);
        assert_eq!(c.current_round(), 1);
        assert_eq!(c.epoch_base(), 2);
        assert_eq!(c.global_weights(), &weights(2.0));
        assert!(c.round().participant_ids().is_empty());

        // every participant is told to stop, and the discarded updates
        // are not forwarded
        assert_eq!(c.heartbeat(&p1).unwrap().state, State::Finished);
        assert_eq!(c.heartbeat(&p2).unwrap().state, State::Finished);
        let events = drain_events(&mut c);
        assert!(events
            .iter()
            .all(|event| matches!(event, Event::ReadLocalWeights { .. })));
    }

    #[test]
    fn end_training_emits_store_events() {
        let mut c = coordinator(2, 1.0, 2);
        let (p1, p2) = (id("p1"), id("p2"));
        c.rendezvous(&p1);
        c.rendezvous(&p2);
        assert!(drain_events(&mut c).is_empty());

        let mut metrics = Metrics::new();
        metrics.insert("loss".into(), vec![arr1(&[0.5f32]).into_dyn()]);
        let request = EndTrainingRoundRequest {
            weights: weights(1.0),
            aggregation_weight: 1,
            metrics: metrics.clone(),
        };
        c.end_training_round(&p1, request).unwrap();
        assert_eq!(
            drain_events(&mut c),
            vec![Event::ReadLocalWeights {
                participant_id: p1.clone(),
                round: 0
            }]
        );

        // metrics are forwarded once the round is aggregated
        c.end_training_round(&p2, end_training(3.0, 1)).unwrap();
        assert_eq!(
            drain_events(&mut c),
            vec![
                Event::ReadLocalWeights {
                    participant_id: p2.clone(),
                    round: 0
                },
                Event::WriteMetrics {
                    participant_id: p1,
                    metrics
                },
                Event::WriteMetrics {
                    participant_id: p2,
                    metrics: Metrics::new()
                },
                Event::WriteGlobalWeights {
                    round: 0,
                    weights: weights(2.0)
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_expired_participants_are_removed() {
        let mut c = coordinator(2, 1.0, 1);
        let (p1, p2) = (id("p1"), id("p2"));
        c.rendezvous(&p1);
        c.rendezvous(&p2);
        tokio::time::advance(Duration::from_secs(15)).await;
        let now = Instant::now();

        // p1's heartbeat is handled before its removal
        c.heartbeat(&p1).unwrap();
        assert!(!c.remove_expired_participant(&p1, now));
        assert!(c.participants().contains(&p1));
        assert_eq!(c.state(), State::Round);

        assert!(c.remove_expired_participant(&p2, now));
        assert_eq!(c.state(), State::StandBy);
        assert!(!c.remove_expired_participant(&p2, now));
    }
}
