//! Coordinator settings, loaded from a configuration file and the
//! `COORDINATOR__*` environment variables.
//!
//! ```toml
//! log_level = "info"
//!
//! [api]
//! bind_address = "127.0.0.1:8081"
//! max_body_size = 67108864
//!
//! [federated_learning]
//! rounds = 10
//! epochs = 2
//! minimum_participants_in_round = 2
//! fraction_of_participants = 0.5
//! aggregation = "federated_averaging"
//! selection = "random"
//!
//! [heartbeat]
//! time = 10
//! timeout = 5
//!
//! [storage]
//! type = "file"
//! directory = "/var/lib/coordinator"
//!
//! [metric_store]
//! url = "http://127.0.0.1:8086"
//! database = "metrics"
//! ```

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use config::{Config, ConfigError, Environment, File, Source};

use crate::{
    api,
    coordinator::{
        Aggregator, CoordinatorConfig, FederatedAveraging, IdentityAggregator, ModelSumAggregator,
        OrderSelector, RandomSelector, Selector,
    },
    metric_store::InfluxMetricsStore,
    store::{FileStore, MemoryStore, Stores},
};

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub api: ApiSettings,
    pub federated_learning: FederatedLearningSettings,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    pub metric_store: Option<MetricStoreSettings>,
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Deserialize)]
pub struct ApiSettings {
    pub bind_address: SocketAddr,
    /// Largest accepted request body, in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,
}

fn default_max_body_size() -> u64 {
    api::DEFAULT_MAX_BODY_SIZE
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_address: ([127, 0, 0, 1], 8081).into(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FederatedLearningSettings {
    pub rounds: u32,
    pub epochs: u32,
    pub minimum_participants_in_round: u32,
    pub fraction_of_participants: f64,
    #[serde(default)]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    pub selection: SelectionSettings,
    /// JSON file holding the initial global weights. The global
    /// weights are initially empty if not set.
    pub initial_weights: Option<PathBuf>,
}

impl FederatedLearningSettings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            num_rounds: self.rounds,
            epochs_per_round: self.epochs,
            minimum_participants_in_round: self.minimum_participants_in_round,
            fraction_of_participants: self.fraction_of_participants,
        }
    }
}

#[derive(Debug, Deserialize, Copy, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationSettings {
    FederatedAveraging,
    Identity,
    ModelSum,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        AggregationSettings::FederatedAveraging
    }
}

impl AggregationSettings {
    pub fn into_aggregator(self) -> Box<dyn Aggregator + Send> {
        match self {
            AggregationSettings::FederatedAveraging => Box::new(FederatedAveraging),
            AggregationSettings::Identity => Box::new(IdentityAggregator),
            AggregationSettings::ModelSum => Box::new(ModelSumAggregator),
        }
    }
}

#[derive(Debug, Deserialize, Copy, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSettings {
    Random,
    Order,
}

impl Default for SelectionSettings {
    fn default() -> Self {
        SelectionSettings::Random
    }
}

impl SelectionSettings {
    pub fn into_selector(self) -> Box<dyn Selector + Send> {
        match self {
            SelectionSettings::Random => Box::new(RandomSelector::new()),
            SelectionSettings::Order => Box::new(OrderSelector),
        }
    }
}

/// A participant is removed when it did not send a heartbeat for
/// `time + timeout` seconds.
#[derive(Debug, Deserialize)]
pub struct HeartbeatSettings {
    /// Expected interval between two heartbeats, in seconds.
    pub time: u64,
    /// Grace period, in seconds.
    pub timeout: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            time: 10,
            timeout: 5,
        }
    }
}

impl HeartbeatSettings {
    pub fn time(&self) -> Duration {
        Duration::from_secs(self.time)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageSettings {
    Memory,
    File { directory: PathBuf },
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings::Memory
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct MetricStoreSettings {
    pub url: String,
    pub database: String,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        Self::load(File::with_name(path))
    }

    fn load<S>(source: S) -> Result<Self, ConfigError>
    where
        S: Source + Send + Sync + 'static,
    {
        Config::builder()
            .add_source(source)
            .add_source(Environment::with_prefix("COORDINATOR").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Build the stores described by the `storage` and
    /// `metric_store` sections.
    pub fn stores(&self) -> Stores {
        let mut stores = match &self.storage {
            StorageSettings::Memory => Stores::memory(Arc::new(MemoryStore::new())),
            StorageSettings::File { directory } => {
                let store = Arc::new(FileStore::new(directory.clone()));
                Stores {
                    global_weights: store.clone(),
                    local_weights: store,
                    ..Stores::default()
                }
            }
        };
        if let Some(metric_store) = &self.metric_store {
            stores.metrics = Arc::new(InfluxMetricsStore::new(
                &metric_store.url,
                &metric_store.database,
            ));
        }
        stores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ParticipantId;
    use config::FileFormat;

    fn parse(toml: &str) -> Result<Settings, ConfigError> {
        Settings::load(File::from_str(toml, FileFormat::Toml))
    }

    const MINIMAL: &str = r#"
        [federated_learning]
        rounds = 3
        epochs = 2
        minimum_participants_in_round = 2
        fraction_of_participants = 0.5
    "#;

    #[test]
    fn defaults() {
        let settings = parse(MINIMAL).unwrap();
        assert_eq!(
            settings.api.bind_address,
            "127.0.0.1:8081".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(settings.api.max_body_size, api::DEFAULT_MAX_BODY_SIZE);
        assert_eq!(settings.heartbeat.time(), Duration::from_secs(10));
        assert_eq!(settings.heartbeat.timeout(), Duration::from_secs(5));
        assert_eq!(settings.storage, StorageSettings::Memory);
        assert!(settings.metric_store.is_none());

        let fl = &settings.federated_learning;
        assert_eq!(fl.aggregation, AggregationSettings::FederatedAveraging);
        assert_eq!(fl.selection, SelectionSettings::Random);
        assert!(fl.initial_weights.is_none());
        assert_eq!(
            fl.coordinator_config(),
            CoordinatorConfig {
                num_rounds: 3,
                epochs_per_round: 2,
                minimum_participants_in_round: 2,
                fraction_of_participants: 0.5,
            }
        );
    }

    #[test]
    fn full() {
        let settings = parse(
            r#"
            log_level = "debug"

            [api]
            bind_address = "0.0.0.0:9000"
            max_body_size = 1024

            [federated_learning]
            rounds = 10
            epochs = 1
            minimum_participants_in_round = 1
            fraction_of_participants = 1.0
            aggregation = "model_sum"
            selection = "order"
            initial_weights = "weights.json"

            [heartbeat]
            time = 30
            timeout = 10

            [storage]
            type = "file"
            directory = "/tmp/coordinator"

            [metric_store]
            url = "http://127.0.0.1:8086"
            database = "metrics"
            "#,
        )
        .unwrap();

        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.api.bind_address.port(), 9000);
        assert_eq!(settings.api.max_body_size, 1024);
        assert_eq!(
            settings.federated_learning.aggregation,
            AggregationSettings::ModelSum
        );
        assert_eq!(
            settings.federated_learning.selection,
            SelectionSettings::Order
        );
        assert_eq!(
            settings.federated_learning.initial_weights,
            Some(PathBuf::from("weights.json"))
        );
        assert_eq!(settings.heartbeat.time(), Duration::from_secs(30));
        assert_eq!(
            settings.storage,
            StorageSettings::File {
                directory: "/tmp/coordinator".into()
            }
        );
        assert_eq!(
            settings.metric_store,
            Some(MetricStoreSettings {
                url: "http://127.0.0.1:8086".into(),
                database: "metrics".into(),
            })
        );
    }

    #[test]
    fn missing_federated_learning_section() {
        assert!(parse("log_level = \"info\"").is_err());
    }

    #[test]
    fn unknown_aggregation() {
        let toml = format!("{}\naggregation = \"median\"", MINIMAL);
        assert!(parse(&toml).is_err());
    }

    #[test]
    fn strategies() {
        use ndarray::arr1;

        let mut aggregator = AggregationSettings::ModelSum.into_aggregator();
        let weights = vec![arr1(&[1.0f32]).into_dyn()];
        let sum = aggregator
            .aggregate(vec![(weights.clone(), 1), (weights, 1)])
            .unwrap();
        assert_eq!(sum, vec![arr1(&[2.0f32]).into_dyn()]);

        let mut selector = SelectionSettings::Order.into_selector();
        let ids = vec![ParticipantId::from("b"), ParticipantId::from("a")];
        assert_eq!(
            selector.select_ids(ids, 0.5),
            vec![ParticipantId::from("a")]
        );
    }
}
