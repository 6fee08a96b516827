//! Messages understood by the coordinator and the corresponding
//! responses.

use derive_more::{Display, From};

use crate::common::{Metrics, Weights};

/// State of the coordinator, as advertised to the participants.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for enough participants to connect, or not selected
    /// for the current round.
    #[display(fmt = "standby")]
    StandBy,
    /// A training round is in progress.
    #[display(fmt = "round")]
    Round,
    /// The training session is over.
    #[display(fmt = "finished")]
    Finished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndTrainingRoundRequest {
    pub weights: Weights,
    pub aggregation_weight: u64,
    #[serde(default)]
    pub metrics: Metrics,
}

/// A message sent by a participant.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Rendezvous,
    Heartbeat,
    StartTrainingRound,
    EndTrainingRound(EndTrainingRoundRequest),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RendezvousResponse {
    /// The participant has been registered.
    Accept,
    /// The coordinator has enough participants: retry later.
    Later,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub state: State,
    pub round: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTrainingRoundResponse {
    /// The current global weights.
    pub weights: Weights,
    /// Number of epochs to train for.
    pub epochs: u32,
    /// Number of epochs the global model has been trained for.
    pub epoch_base: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EndTrainingRoundResponse {}

/// Response to a [`Message`].
#[derive(Debug, Clone, PartialEq, From)]
pub enum Response {
    Rendezvous(RendezvousResponse),
    Heartbeat(HeartbeatResponse),
    StartTrainingRound(StartTrainingRoundResponse),
    EndTrainingRound(EndTrainingRoundResponse),
}

impl Message {
    /// Name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Rendezvous => "rendezvous",
            Message::Heartbeat => "heartbeat",
            Message::StartTrainingRound => "start training round",
            Message::EndTrainingRound(_) => "end training round",
        }
    }
}
