use std::error::Error;

use derive_more::Display;

use crate::common::ParticipantId;

/// Error returned by the coordinator state machine when it rejects a
/// message. A rejected message never modifies the coordinator state,
/// except for [`CoordinatorError::Aggregation`] which aborts the
/// training session.
#[derive(Debug, Display, PartialEq)]
pub enum CoordinatorError {
    /// A message other than a rendez-vous request was sent by a
    /// participant that is not registered.
    #[display(
        fmt = "unknown participant {}: rendez-vous with the coordinator first",
        _0
    )]
    UnknownParticipant(ParticipantId),

    /// The message is not allowed in the current state, or the
    /// participant was not selected for the current round.
    #[display(fmt = "invalid request: {}", _0)]
    InvalidRequest(String),

    /// The participant already submitted an update for the current
    /// round.
    #[display(fmt = "participant {} already submitted an update for this round", _0)]
    DuplicatedUpdate(ParticipantId),

    /// The updates of the round could not be aggregated.
    #[display(fmt = "aggregation failed: {}", _0)]
    Aggregation(AggregationError),
}

impl Error for CoordinatorError {}

impl From<AggregationError> for CoordinatorError {
    fn from(err: AggregationError) -> Self {
        Self::Aggregation(err)
    }
}

/// Error returned by an [`Aggregator`](crate::coordinator::Aggregator).
#[derive(Debug, Display, PartialEq, Clone)]
pub enum AggregationError {
    #[display(fmt = "no updates to aggregate")]
    NoUpdates,

    /// The aggregation weights of all the updates sum up to zero.
    #[display(fmt = "the total aggregation weight is zero")]
    ZeroTotalWeight,

    #[display(fmt = "expected {} layers but an update has {}", expected, actual)]
    LayerCountMismatch { expected: usize, actual: usize },

    #[display(
        fmt = "layer {} has shape {:?} but an update has shape {:?}",
        layer,
        expected,
        actual
    )]
    ShapeMismatch {
        layer: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[display(fmt = "expected {} update(s) but got {}", expected, actual)]
    UnexpectedUpdateCount { expected: usize, actual: usize },
}

impl Error for AggregationError {}

/// Error returned when building a coordinator with an invalid
/// configuration.
#[derive(Debug, Display, PartialEq)]
#[display(fmt = "invalid coordinator configuration: {}", _0)]
pub struct InvalidConfig(pub String);

impl Error for InvalidConfig {}

/// Error returned by a [`CoordinatorHandle`](crate::coordinator::CoordinatorHandle).
#[derive(Debug, Display, PartialEq)]
pub enum RequestError {
    /// The coordinator service shut down.
    #[display(fmt = "the coordinator service shut down")]
    ShutDown,

    /// The coordinator rejected the request.
    #[display(fmt = "{}", _0)]
    Coordinator(CoordinatorError),
}

impl Error for RequestError {}

impl From<CoordinatorError> for RequestError {
    fn from(err: CoordinatorError) -> Self {
        Self::Coordinator(err)
    }
}
