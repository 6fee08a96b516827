use std::sync::Arc;

use futures::future::join_all;
use tokio::{
    sync::watch,
    time::{sleep_until, Instant},
};

use crate::coordinator::{
    error::RequestError, participants::ParticipantRegistry, service::CoordinatorHandle,
};

/// Background task that removes the participants whose heartbeat
/// expired.
pub struct HeartbeatMonitor {
    participants: Arc<ParticipantRegistry>,
    handle: CoordinatorHandle,
    shutdown: watch::Receiver<bool>,
}

impl HeartbeatMonitor {
    /// Create a monitor for the given registry. The monitor stops
    /// when `true` is sent on the `shutdown` channel, or when its
    /// sender is dropped.
    pub fn new(
        participants: Arc<ParticipantRegistry>,
        handle: CoordinatorHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            participants,
            handle,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("heartbeat monitor started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // The coordinator checks the expiration again before
            // removing a participant, since a heartbeat may be queued
            // ahead of the removal.
            let now = Instant::now();
            let expired = self.participants.expired(now);
            if !expired.is_empty() {
                info!("{} participant(s) timed out", expired.len());
                let handle = &self.handle;
                let results = join_all(
                    expired
                        .into_iter()
                        .map(|id| handle.remove_expired_participant(id, now)),
                )
                .await;
                if results.contains(&Err(RequestError::ShutDown)) {
                    warn!("coordinator service is gone, stopping the heartbeat monitor");
                    break;
                }
            }

            // The registry is not locked while sleeping, and the next
            // expiration is recomputed on each iteration.
            let next_expiration = self.participants.next_expiration();
            tokio::select! {
                _ = sleep_until(next_expiration) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("heartbeat monitor stopped");
    }
}
