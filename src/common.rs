use std::{collections::HashMap, convert::Infallible, str::FromStr};

use derive_more::Display;
use ndarray::ArrayD;
use uuid::Uuid;

/// A single layer of a model.
pub type Tensor = ArrayD<f32>;

/// The weights of a model, one tensor per layer.
pub type Weights = Vec<Tensor>;

/// Metrics reported by a participant at the end of a training round:
/// for each metric name, one data point per local epoch.
pub type Metrics = HashMap<String, Vec<Tensor>>;

#[derive(Eq, PartialEq, Hash, Ord, PartialOrd, Debug, Clone, Display, Serialize, Deserialize)]
#[serde(transparent)]
/// An opaque participant identifier, typically a peer address or a
/// public key.
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Return a new random participant identifier, for transports
    /// that cannot identify their peers.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl FromStr for ParticipantId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_unique() {
        let a = ParticipantId::random();
        let b = ParticipantId::random();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ParticipantId::from("127.0.0.1:4242");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"127.0.0.1:4242\"");
        assert_eq!(id.to_string(), "127.0.0.1:4242");
    }
}
