//! Agent ingress: the loopback HTTP server the in-process APM agents talk
//! to.
//!
//! Three routes:
//! - `GET /` is an opaque passthrough to the APM server root, so agents can
//!   probe server version and capabilities.
//! - `POST /intake/v2/events` accepts ND-JSON payloads and funnels them onto
//!   the agent-data channel. `?flushed=true` additionally releases the
//!   end-of-invocation flush barrier.
//! - `POST /register/transaction` lets an agent announce its transaction id
//!   and a partial transaction before user code runs.

use crate::accumulator::{AgentPayload, Batch};
use crate::shipper::ApmServerClient;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, header::CONTENT_ENCODING},
    response::{IntoResponse, Response},
    routing::{any, post},
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const REQUEST_ID_HEADER: &str = "x-elastic-aws-request-id";
const TRANSACTION_ID_HEADER: &str = "x-elastic-transaction-id";

/// Errors from the intake server.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum IntakeError {
    /// The server socket failed.
    #[error("agent intake server failed")]
    Io(#[source] std::io::Error),
}

/// Shared state for the intake handlers.
#[derive(Clone)]
pub(crate) struct IntakeState {
    pub agent_tx: mpsc::Sender<AgentPayload>,
    pub agent_done_tx: mpsc::Sender<()>,
    pub batch: Arc<Batch>,
    pub shipper: Arc<ApmServerClient>,
}

/// Loopback HTTP server receiving agent submissions.
pub struct IntakeServer {
    port: u16,
    state: IntakeState,
    cancel_token: CancellationToken,
}

impl IntakeServer {
    /// Creates an intake server.
    ///
    /// Payloads are enqueued on `agent_tx` in arrival order; a bounded
    /// channel delays the `202` response and thereby the agent's next POST.
    /// `agent_done_tx` carries the `flushed=true` barrier release.
    pub fn new(
        port: u16,
        agent_tx: mpsc::Sender<AgentPayload>,
        agent_done_tx: mpsc::Sender<()>,
        batch: Arc<Batch>,
        shipper: Arc<ApmServerClient>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            port,
            state: IntakeState {
                agent_tx,
                agent_done_tx,
                batch,
                shipper,
            },
            cancel_token,
        }
    }

    /// Binds the server socket and returns the serve future.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn start(
        self,
    ) -> Result<std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>, IntakeError> {
        let app = router(self.state);
        let addr = SocketAddr::from(([127, 0, 0, 1], self.port));
        let listener = TcpListener::bind(addr).await.map_err(IntakeError::Io)?;

        tracing::info!(port = self.port, "Agent intake server started");

        let cancel_token = self.cancel_token;
        Ok(Box::pin(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(cancel_token.cancelled_owned())
                .await;
        }))
    }
}

pub(crate) fn router(state: IntakeState) -> Router {
    Router::new()
        .route("/intake/v2/events", post(handle_intake))
        .route("/register/transaction", post(handle_register_transaction))
        .route("/", any(handle_info))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IntakeQuery {
    #[serde(default)]
    flushed: Option<String>,
}

/// POST /intake/v2/events
async fn handle_intake(
    State(state): State<IntakeState>,
    Query(query): Query<IntakeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !body.is_empty() {
        let payload = AgentPayload {
            data: body.to_vec(),
            content_encoding: headers
                .get(CONTENT_ENCODING)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        };
        tracing::debug!(bytes = payload.data.len(), "Queueing agent data");
        if state.agent_tx.send(payload).await.is_err() {
            tracing::error!("Agent data channel closed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    if query.flushed.as_deref() == Some("true") {
        // The barrier is capacity-one; a pending release is equivalent.
        let _ = state.agent_done_tx.try_send(());
    }

    (StatusCode::ACCEPTED, "ok").into_response()
}

/// POST /register/transaction
async fn handle_register_transaction(
    State(state): State<IntakeState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(request_id) = header_str(&headers, REQUEST_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing request id header").into_response();
    };
    let Some(transaction_id) = header_str(&headers, TRANSACTION_ID_HEADER) else {
        return (StatusCode::BAD_REQUEST, "missing transaction id header").into_response();
    };

    match state.batch.on_agent_init(request_id, transaction_id, &body) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => {
            tracing::warn!(%error, request_id, "Rejected transaction registration");
            (StatusCode::BAD_REQUEST, "invalid payload").into_response()
        }
    }
}

/// GET (or any method) /
///
/// Upstream failures are logged and answered with an empty `200`; they are
/// never surfaced as core errors.
async fn handle_info(State(state): State<IntakeState>, method: Method, headers: HeaderMap) -> Response {
    let upstream = match state.shipper.forward_info(method, headers).await {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::warn!(%error, "Failed to forward info request to APM server");
            return StatusCode::OK.into_response();
        }
    };

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(%error, "Failed to read info response from APM server");
            return StatusCode::OK.into_response();
        }
    };

    let mut builder = axum::http::Response::builder().status(status.as_u16());
    for (name, value) in &upstream_headers {
        if *name == reqwest::header::TRANSFER_ENCODING || *name == reqwest::header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::OK.into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
