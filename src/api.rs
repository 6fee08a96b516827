//! HTTP front-end of the coordinator.

use std::{convert::Infallible, future::Future, net::SocketAddr};

use serde::Serialize;
use warp::{
    http::StatusCode,
    reply::{self, Reply, Response},
    Filter, Rejection,
};

use crate::{
    common::ParticipantId,
    coordinator::{
        CoordinatorError, CoordinatorHandle, EndTrainingRoundRequest, RendezvousResponse,
        RequestError,
    },
};

pub mod models {
    use crate::{common::ParticipantId, coordinator::RendezvousResponse};

    /// Response to a rendez-vous request. The participant must use
    /// `id` in all its subsequent requests.
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    pub struct RendezvousReply {
        pub reply: RendezvousResponse,
        pub id: Option<ParticipantId>,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    pub struct ErrorReply {
        pub error: String,
    }
}

use self::models::{ErrorReply, RendezvousReply};

/// Default limit on the size of a request body, in bytes.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// The routes of the coordinator API. Requests with a body larger
/// than `max_body_size` bytes are rejected.
pub fn filters(
    handle: CoordinatorHandle,
    max_body_size: u64,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let handle = warp::any().map(move || handle.clone());

    let rendezvous = warp::path!("rendezvous")
        .and(warp::post())
        .and(handle.clone())
        .and_then(rendezvous);

    let heartbeat = warp::path!("heartbeat" / ParticipantId)
        .and(warp::get())
        .and(handle.clone())
        .and_then(|id, handle: CoordinatorHandle| async move {
            Ok::<_, Infallible>(into_response(handle.heartbeat(id).await))
        });

    let start_training_round = warp::path!("start_training_round" / ParticipantId)
        .and(warp::get())
        .and(handle.clone())
        .and_then(|id, handle: CoordinatorHandle| async move {
            Ok::<_, Infallible>(into_response(handle.start_training_round(id).await))
        });

    let end_training_round = warp::path!("end_training_round" / ParticipantId)
        .and(warp::post())
        .and(warp::body::content_length_limit(max_body_size))
        .and(warp::body::json())
        .and(handle)
        .and_then(
            |id, request: EndTrainingRoundRequest, handle: CoordinatorHandle| async move {
                Ok::<_, Infallible>(into_response(
                    handle.end_training_round(id, request).await,
                ))
            },
        );

    rendezvous
        .or(heartbeat)
        .or(start_training_round)
        .or(end_training_round)
        .with(warp::log("http"))
}

/// Serve the API until `shutdown` completes.
pub async fn serve<F>(
    bind_address: SocketAddr,
    max_body_size: u64,
    handle: CoordinatorHandle,
    shutdown: F,
) -> Result<(), warp::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (address, server) = warp::serve(filters(handle, max_body_size))
        .try_bind_with_graceful_shutdown(bind_address, shutdown)?;
    info!("starting HTTP server on {}", address);
    server.await;
    info!("HTTP server stopped");
    Ok(())
}

async fn rendezvous(handle: CoordinatorHandle) -> Result<Response, Infallible> {
    let id = ParticipantId::random();
    let result = handle.rendezvous(id.clone()).await.map(|reply| {
        let id = match reply {
            RendezvousResponse::Accept => Some(id),
            RendezvousResponse::Later => None,
        };
        RendezvousReply { reply, id }
    });
    Ok(into_response(result))
}

fn into_response<T: Serialize>(result: Result<T, RequestError>) -> Response {
    match result {
        Ok(response) => reply::json(&response).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: RequestError) -> Response {
    let status = match &e {
        RequestError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
        RequestError::Coordinator(e) => match e {
            CoordinatorError::UnknownParticipant(_) => StatusCode::FORBIDDEN,
            CoordinatorError::InvalidRequest(_) => StatusCode::PRECONDITION_FAILED,
            CoordinatorError::DuplicatedUpdate(_) => StatusCode::CONFLICT,
            CoordinatorError::Aggregation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    debug!("request failed ({}): {}", status, e);
    let body = ErrorReply {
        error: e.to_string(),
    };
    reply::with_status(reply::json(&body), status).into_response()
}
