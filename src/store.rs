//! Storage backends the coordinator talks to.
//!
//! None of these are needed for the protocol to make progress: the
//! coordinator service logs their failures and carries on.

use std::{
    collections::HashMap,
    error::Error,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use derive_more::Display;

use crate::common::{Metrics, ParticipantId, Weights};

#[derive(Debug, Display)]
pub enum StoreError {
    #[display(fmt = "not found: {}", _0)]
    NotFound(String),

    #[display(fmt = "I/O error: {}", _0)]
    Io(io::Error),

    #[display(fmt = "failed to (de)serialize weights: {}", _0)]
    Serialization(serde_json::Error),

    #[display(fmt = "storage backend error: {}", _0)]
    Backend(String),
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e)
    }
}

/// Where the global weights are saved after each round.
#[async_trait]
pub trait GlobalWeightsStore: Send + Sync {
    async fn write_weights(&self, round: u32, weights: &Weights) -> Result<(), StoreError>;
    async fn read_weights(&self, round: u32) -> Result<Weights, StoreError>;
}

/// Where the participants upload their local weights.
#[async_trait]
pub trait LocalWeightsReader: Send + Sync {
    async fn read_weights(
        &self,
        participant_id: &ParticipantId,
        round: u32,
    ) -> Result<Weights, StoreError>;
}

/// Sink for the training metrics reported by the participants.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn write_metrics(
        &self,
        participant_id: &ParticipantId,
        metrics: &Metrics,
    ) -> Result<(), StoreError>;
}

/// The stores used by a
/// [`CoordinatorService`](crate::coordinator::CoordinatorService).
#[derive(Clone)]
pub struct Stores {
    pub global_weights: Arc<dyn GlobalWeightsStore>,
    pub local_weights: Arc<dyn LocalWeightsReader>,
    pub metrics: Arc<dyn MetricsStore>,
}

impl Default for Stores {
    fn default() -> Self {
        let store = Arc::new(NullStore);
        Self {
            global_weights: store.clone(),
            local_weights: store.clone(),
            metrics: store,
        }
    }
}

impl Stores {
    /// Use the same in-memory store for everything.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            global_weights: store.clone(),
            local_weights: store.clone(),
            metrics: store,
        }
    }
}

/// A store that discards everything. Reads return empty weights.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl GlobalWeightsStore for NullStore {
    async fn write_weights(&self, _round: u32, _weights: &Weights) -> Result<(), StoreError> {
        Ok(())
    }

    async fn read_weights(&self, _round: u32) -> Result<Weights, StoreError> {
        Ok(Weights::new())
    }
}

#[async_trait]
impl LocalWeightsReader for NullStore {
    async fn read_weights(
        &self,
        _participant_id: &ParticipantId,
        _round: u32,
    ) -> Result<Weights, StoreError> {
        Ok(Weights::new())
    }
}

#[async_trait]
impl MetricsStore for NullStore {
    async fn write_metrics(
        &self,
        _participant_id: &ParticipantId,
        _metrics: &Metrics,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    global_weights: Mutex<HashMap<u32, Weights>>,
    local_weights: Mutex<HashMap<(ParticipantId, u32), Weights>>,
    metrics: Mutex<Vec<(ParticipantId, Metrics)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make local weights available to [`LocalWeightsReader::read_weights`].
    pub fn put_local_weights(&self, participant_id: ParticipantId, round: u32, weights: Weights) {
        lock(&self.local_weights).insert((participant_id, round), weights);
    }

    /// Rounds for which global weights have been written, in
    /// increasing order.
    pub fn global_weights_rounds(&self) -> Vec<u32> {
        let mut rounds: Vec<u32> = lock(&self.global_weights).keys().cloned().collect();
        rounds.sort_unstable();
        rounds
    }

    /// Every metrics write, in order.
    pub fn metrics(&self) -> Vec<(ParticipantId, Metrics)> {
        lock(&self.metrics).clone()
    }
}

#[async_trait]
impl GlobalWeightsStore for MemoryStore {
    async fn write_weights(&self, round: u32, weights: &Weights) -> Result<(), StoreError> {
        lock(&self.global_weights).insert(round, weights.clone());
        Ok(())
    }

    async fn read_weights(&self, round: u32) -> Result<Weights, StoreError> {
        lock(&self.global_weights)
            .get(&round)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("global weights of round {}", round)))
    }
}

#[async_trait]
impl LocalWeightsReader for MemoryStore {
    async fn read_weights(
        &self,
        participant_id: &ParticipantId,
        round: u32,
    ) -> Result<Weights, StoreError> {
        lock(&self.local_weights)
            .get(&(participant_id.clone(), round))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "local weights of participant {} for round {}",
                    participant_id, round
                ))
            })
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn write_metrics(
        &self,
        participant_id: &ParticipantId,
        metrics: &Metrics,
    ) -> Result<(), StoreError> {
        lock(&self.metrics).push((participant_id.clone(), metrics.clone()));
        Ok(())
    }
}

/// A store that saves weights as JSON files:
///
/// - global weights in `<directory>/<round>.json`
/// - local weights in `<directory>/<participant>/<round>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn global_weights_path(&self, round: u32) -> PathBuf {
        self.directory.join(format!("{}.json", round))
    }

    fn local_weights_path(
        &self,
        participant_id: &ParticipantId,
        round: u32,
    ) -> Result<PathBuf, StoreError> {
        let id = participant_id.as_str();
        if id.is_empty() || id == "." || id == ".." || id.contains(|c| c == '/' || c == '\\') {
            return Err(StoreError::Backend(format!(
                "participant id {:?} cannot be used as a directory name",
                id
            )));
        }
        Ok(self.directory.join(id).join(format!("{}.json", round)))
    }

    /// Write the local weights of a participant. This is what a
    /// participant uploading to a shared directory would do.
    pub async fn write_local_weights(
        &self,
        participant_id: &ParticipantId,
        round: u32,
        weights: &Weights,
    ) -> Result<(), StoreError> {
        let path = self.local_weights_path(participant_id, round)?;
        write_json(&path, weights).await
    }
}

async fn write_json(path: &Path, weights: &Weights) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec(weights)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn read_json(path: &Path) -> Result<Weights, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl GlobalWeightsStore for FileStore {
    async fn write_weights(&self, round: u32, weights: &Weights) -> Result<(), StoreError> {
        let path = self.global_weights_path(round);
        debug!("writing global weights to {}", path.display());
        write_json(&path, weights).await
    }

    async fn read_weights(&self, round: u32) -> Result<Weights, StoreError> {
        read_json(&self.global_weights_path(round)).await
    }
}

#[async_trait]
impl LocalWeightsReader for FileStore {
    async fn read_weights(
        &self,
        participant_id: &ParticipantId,
        round: u32,
    ) -> Result<Weights, StoreError> {
        let path = self.local_weights_path(participant_id, round)?;
        read_json(&path).await
    }
}

/// Load weights from a JSON file, as written by [`FileStore`].
pub async fn load_weights<P: AsRef<Path>>(path: P) -> Result<Weights, StoreError> {
    read_json(path.as_ref()).await
}
