//! InfluxDB sink for the participants' training metrics.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use influxdb::{Client, Timestamp, Type, WriteQuery};

use crate::{
    common::{Metrics, ParticipantId, Tensor},
    store::{MetricsStore, StoreError},
};

/// Spacing between the data points of two consecutive epochs. The
/// participants do not timestamp their metrics.
const EPOCH_SPACING_MS: u128 = 1000;

pub struct InfluxMetricsStore {
    client: Client,
}

impl InfluxMetricsStore {
    pub fn new(url: &str, database: &str) -> Self {
        Self {
            client: Client::new(url, database),
        }
    }
}

/// Turn the metrics of a participant into one data point per metric
/// and per epoch. Each metric is written to the
/// `participant.ai.<name>` measurement, tagged with the participant
/// id.
pub fn metrics_to_queries(
    participant_id: &ParticipantId,
    metrics: &Metrics,
    start_ms: u128,
) -> Vec<WriteQuery> {
    let mut queries = Vec::new();
    for (name, epochs) in metrics.iter() {
        for (epoch, value) in epochs.iter().enumerate() {
            let time = start_ms + epoch as u128 * EPOCH_SPACING_MS;
            let query = WriteQuery::new(
                Timestamp::Milliseconds(time),
                format!("participant.ai.{}", name),
            )
            .add_field(name.as_str(), field_value(value))
            .add_tag("id", participant_id.as_str());
            queries.push(query);
        }
    }
    queries
}

/// Scalar metrics are written as floats, anything else as a string.
fn field_value(tensor: &Tensor) -> Type {
    if tensor.len() == 1 {
        if let Some(value) = tensor.iter().next() {
            return Type::Float(*value as f64);
        }
    }
    let values: Vec<String> = tensor.iter().map(|v| format!("{:.8}", v)).collect();
    Type::Text(format!("[{}]", values.join(" ")))
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[async_trait]
impl MetricsStore for InfluxMetricsStore {
    async fn write_metrics(
        &self,
        participant_id: &ParticipantId,
        metrics: &Metrics,
    ) -> Result<(), StoreError> {
        let queries = metrics_to_queries(participant_id, metrics, now_ms());
        if queries.is_empty() {
            return Ok(());
        }
        debug!(
            "writing {} metric data point(s) for participant {}",
            queries.len(),
            participant_id
        );
        self.client
            .query(queries)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
