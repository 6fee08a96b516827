use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{timeout, Instant},
};

use crate::{
    common::ParticipantId,
    coordinator::{
        aggregator::Aggregator,
        error::{CoordinatorError, RequestError},
        models::{
            EndTrainingRoundRequest, EndTrainingRoundResponse, HeartbeatResponse, Message,
            RendezvousResponse, Response, StartTrainingRoundResponse,
        },
        protocol::{Coordinator, Event},
        selector::Selector,
    },
    store::Stores,
};

/// Capacity of the requests channel. Senders wait when it is full.
const REQUESTS_CHANNEL_SIZE: usize = 2048;

/// Time after which a store operation is given up.
const STORE_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the [`Coordinator`] and processes the requests sent through
/// the [`CoordinatorHandle`]s one at a time, so that each request is
/// handled atomically.
///
/// The events emitted by the coordinator are handed over to a
/// separate task that talks to the stores, so that a slow store
/// never delays the requests.
pub struct CoordinatorService<A, S>
where
    A: Aggregator,
    S: Selector,
{
    requests_rx: mpsc::Receiver<Request>,
    coordinator: Coordinator<A, S>,
    stores: Stores,
}

impl<A, S> CoordinatorService<A, S>
where
    A: Aggregator,
    S: Selector,
{
    pub fn new(coordinator: Coordinator<A, S>, stores: Stores) -> (Self, CoordinatorHandle) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUESTS_CHANNEL_SIZE);
        let service = Self {
            requests_rx,
            coordinator,
            stores,
        };
        (service, CoordinatorHandle::new(requests_tx))
    }

    /// Process requests until all the handles are dropped. The
    /// pending store operations are completed before returning.
    pub async fn run(mut self) {
        info!("coordinator service started");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store_task = handle_store_events(self.stores.clone(), events_rx);
        let store_task_handle = tokio::spawn(store_task);

        while let Some(request) = self.requests_rx.recv().await {
            self.dispatch_request(request);
            while let Some(event) = self.coordinator.next_event() {
                if events_tx.send(event).is_err() {
                    error!("store task is gone, dropping event");
                }
            }
        }
        info!("coordinator service stopped: all the handles have been dropped");

        drop(events_tx);
        if let Err(e) = store_task_handle.await {
            error!("store task failed: {}", e);
        }
    }

    /// Handle a request. The response is sent before the resulting
    /// events are processed.
    fn dispatch_request(&mut self, request: Request) {
        match request {
            Request::Rendezvous((id, response_sender)) => {
                response_sender.send(self.coordinator.rendezvous(&id))
            }
            Request::Heartbeat((id, response_sender)) => {
                response_sender.send(self.coordinator.heartbeat(&id))
            }
            Request::StartTrainingRound((id, response_sender)) => {
                response_sender.send(self.coordinator.start_training_round(&id))
            }
            Request::EndTrainingRound(((id, payload), response_sender)) => {
                response_sender.send(self.coordinator.end_training_round(&id, payload))
            }
            Request::Message(((id, message), response_sender)) => {
                response_sender.send(self.coordinator.on_message(message, &id))
            }
            Request::RemoveParticipant((id, response_sender)) => {
                self.coordinator.remove_participant(&id);
                response_sender.send(())
            }
            Request::RemoveExpiredParticipant(((id, now), response_sender)) => {
                response_sender.send(self.coordinator.remove_expired_participant(&id, now))
            }
        }
    }
}

/// Carry out the coordinator events, in the order they were emitted,
/// until the sending side is dropped. Storage failures are logged and
/// otherwise ignored.
async fn handle_store_events(stores: Stores, mut events_rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events_rx.recv().await {
        let description = event.to_string();
        let dispatch = dispatch_event(&stores, event);
        if timeout(STORE_TIMEOUT, dispatch).await.is_err() {
            error!("store operation timed out: {}", description);
        }
    }
    debug!("store task stopped");
}

async fn dispatch_event(stores: &Stores, event: Event) {
    match event {
        Event::WriteGlobalWeights { round, weights } => {
            match stores.global_weights.write_weights(round, &weights).await {
                Ok(()) => debug!("saved global weights of round {}", round),
                Err(e) => error!("failed to save global weights of round {}: {}", round, e),
            }
        }
        Event::ReadLocalWeights {
            participant_id,
            round,
        } => match stores
            .local_weights
            .read_weights(&participant_id, round)
            .await
        {
            Ok(weights) => debug!(
                "read {} layer(s) of local weights from participant {} for round {}",
                weights.len(),
                participant_id,
                round
            ),
            Err(e) => warn!(
                "failed to read local weights of participant {} for round {}: {}",
                participant_id, round, e
            ),
        },
        Event::WriteMetrics {
            participant_id,
            metrics,
        } => {
            let written = stores
                .metrics
                .write_metrics(&participant_id, &metrics)
                .await;
            if let Err(e) = written {
                warn!(
                    "failed to write metrics of participant {}: {}",
                    participant_id, e
                );
            }
        }
    }
}

pub struct ResponseReceiver<R>(oneshot::Receiver<R>);

pub fn response_channel<R>() -> (ResponseSender<R>, ResponseReceiver<R>) {
    let (tx, rx) = oneshot::channel::<R>();
    (ResponseSender(tx), ResponseReceiver(rx))
}

impl<R> Future for ResponseReceiver<R> {
    type Output = Result<R>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().0)
            .poll(cx)
            .map_err(|_| RequestError::ShutDown)
    }
}

pub struct ResponseSender<R>(oneshot::Sender<R>);

impl<R> ResponseSender<R> {
    pub fn send(self, response: R) {
        self.0.send(response).unwrap_or_else(|_| {
            warn!("failed to send response: receiver shut down");
        })
    }
}

pub type RequestMessage<P, R> = (P, ResponseSender<R>);

type ProtocolResult<T> = ::std::result::Result<T, CoordinatorError>;

pub enum Request {
    Rendezvous(RequestMessage<ParticipantId, RendezvousResponse>),
    Heartbeat(RequestMessage<ParticipantId, ProtocolResult<HeartbeatResponse>>),
    StartTrainingRound(RequestMessage<ParticipantId, ProtocolResult<StartTrainingRoundResponse>>),
    EndTrainingRound(
        RequestMessage<
            (ParticipantId, EndTrainingRoundRequest),
            ProtocolResult<EndTrainingRoundResponse>,
        >,
    ),
    Message(RequestMessage<(ParticipantId, Message), ProtocolResult<Response>>),
    RemoveParticipant(RequestMessage<ParticipantId, ()>),
    RemoveExpiredParticipant(RequestMessage<(ParticipantId, Instant), bool>),
}

/// A cheap, cloneable handle to a [`CoordinatorService`].
#[derive(Clone)]
pub struct CoordinatorHandle(mpsc::Sender<Request>);

type Result<T> = ::std::result::Result<T, RequestError>;

impl CoordinatorHandle {
    pub fn new(requests_tx: mpsc::Sender<Request>) -> Self {
        Self(requests_tx)
    }

    async fn request<R>(
        &self,
        make_request: impl FnOnce(ResponseSender<R>) -> Request,
    ) -> Result<R> {
        let (resp_tx, resp_rx) = response_channel::<R>();
        self.0
            .send(make_request(resp_tx))
            .await
            .map_err(|_| RequestError::ShutDown)?;
        resp_rx.await
    }

    pub async fn rendezvous(&self, id: ParticipantId) -> Result<RendezvousResponse> {
        self.request(|tx| Request::Rendezvous((id, tx))).await
    }

    pub async fn heartbeat(&self, id: ParticipantId) -> Result<HeartbeatResponse> {
        Ok(self.request(|tx| Request::Heartbeat((id, tx))).await??)
    }

    pub async fn start_training_round(
        &self,
        id: ParticipantId,
    ) -> Result<StartTrainingRoundResponse> {
        Ok(self
            .request(|tx| Request::StartTrainingRound((id, tx)))
            .await??)
    }

    pub async fn end_training_round(
        &self,
        id: ParticipantId,
        request: EndTrainingRoundRequest,
    ) -> Result<EndTrainingRoundResponse> {
        Ok(self
            .request(|tx| Request::EndTrainingRound(((id, request), tx)))
            .await??)
    }

    /// Send any kind of message on behalf of the given participant.
    pub async fn on_message(&self, id: ParticipantId, message: Message) -> Result<Response> {
        Ok(self
            .request(|tx| Request::Message(((id, message), tx)))
            .await??)
    }

    /// Remove a participant from the coordinator.
    pub async fn remove_participant(&self, id: ParticipantId) -> Result<()> {
        self.request(|tx| Request::RemoveParticipant((id, tx)))
            .await
    }

    /// Remove a participant whose heartbeat was found expired at
    /// `now`, unless it sent a heartbeat since then. Return whether
    /// the participant was removed.
    pub async fn remove_expired_participant(
        &self,
        id: ParticipantId,
        now: Instant,
    ) -> Result<bool> {
        self.request(|tx| Request::RemoveExpiredParticipant(((id, now), tx)))
            .await
    }
}
