//! The coordinator: a state machine driving the training rounds
//! ([`Coordinator`]), the service that owns it ([`CoordinatorService`])
//! and the task evicting silent participants ([`HeartbeatMonitor`]).

pub mod aggregator;
pub mod error;
pub mod heartbeat;
pub mod models;
pub mod participants;
pub mod protocol;
pub mod round;
pub mod selector;
pub mod service;

pub use self::{
    aggregator::{Aggregator, FederatedAveraging, IdentityAggregator, ModelSumAggregator},
    error::{AggregationError, CoordinatorError, InvalidConfig, RequestError},
    heartbeat::HeartbeatMonitor,
    models::{
        EndTrainingRoundRequest, EndTrainingRoundResponse, HeartbeatResponse, Message,
        RendezvousResponse, Response, StartTrainingRoundResponse, State,
    },
    participants::ParticipantRegistry,
    protocol::{Coordinator, CoordinatorConfig, Event},
    round::{Round, Update},
    selector::{OrderSelector, RandomSelector, Selector},
    service::{CoordinatorHandle, CoordinatorService},
};
