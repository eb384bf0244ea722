//! Lambda Telemetry API subscription and listener.
//!
//! The extension subscribes to `platform` telemetry and receives event
//! batches on a loopback HTTP listener. Only the records the coordinator
//! consumes are parsed into types; everything else is skipped per element so
//! one unknown record never poisons the batch it arrived with.

use axum::{
    Router, body::Bytes, extract::State, http::StatusCode, response::IntoResponse, routing::post,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SCHEMA_VERSION: &str = "2022-12-13";
const SUBSCRIBE_PATH: &str = "/2022-07-01/telemetry";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors from Telemetry API operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The subscription request failed.
    #[error("telemetry subscription request failed")]
    Http(#[from] reqwest::Error),

    /// The runtime rejected the subscription.
    #[error("telemetry subscription returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The listener socket failed.
    #[error("telemetry listener failed")]
    Io(#[source] std::io::Error),
}

/// Platform events consumed by the invocation coordinator.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    /// `platform.initReport`: the init phase completed.
    InitReport {
        /// Init phase duration in milliseconds.
        duration_ms: f64,
    },
    /// `platform.runtimeDone`: the runtime finished processing an
    /// invocation.
    RuntimeDone {
        /// Request id of the invocation.
        request_id: String,
        /// Terminal status (`success`, `error`, `timeout`, `failure`).
        status: String,
        /// Event time.
        time: DateTime<Utc>,
    },
    /// `platform.report`: final metrics for an invocation.
    Report {
        /// Request id of the invocation.
        request_id: String,
        /// Billed duration in milliseconds, when present.
        billed_duration_ms: Option<f64>,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    record: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitReportRecord {
    metrics: InitReportMetrics,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitReportMetrics {
    duration_ms: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeDoneRecord {
    request_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRecord {
    request_id: String,
    #[serde(default)]
    metrics: Option<ReportMetrics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportMetrics {
    #[serde(default)]
    billed_duration_ms: Option<f64>,
}

/// Parses one telemetry element into a coordinator event.
///
/// Returns `None` for event kinds the coordinator does not consume or for
/// records that fail to parse (logged at debug level).
fn parse_event(raw: RawEvent) -> Option<PlatformEvent> {
    match raw.kind.as_str() {
        "platform.initReport" => {
            let record: InitReportRecord = parse_record(&raw.kind, raw.record)?;
            Some(PlatformEvent::InitReport {
                duration_ms: record.metrics.duration_ms,
            })
        }
        "platform.runtimeDone" => {
            let record: RuntimeDoneRecord = parse_record(&raw.kind, raw.record)?;
            Some(PlatformEvent::RuntimeDone {
                request_id: record.request_id,
                status: record.status,
                time: raw.time.unwrap_or_else(Utc::now),
            })
        }
        "platform.report" => {
            let record: ReportRecord = parse_record(&raw.kind, raw.record)?;
            Some(PlatformEvent::Report {
                request_id: record.request_id,
                billed_duration_ms: record.metrics.and_then(|m| m.billed_duration_ms),
            })
        }
        other => {
            tracing::debug!(kind = other, "Skipping telemetry event");
            None
        }
    }
}

fn parse_record<T: serde::de::DeserializeOwned>(kind: &str, record: Value) -> Option<T> {
    match serde_json::from_value(record) {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            tracing::debug!(kind, %error, "Failed to parse telemetry record");
            None
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionRequest {
    schema_version: &'static str,
    types: Vec<&'static str>,
    buffering: Buffering,
    destination: Destination,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Buffering {
    max_items: u32,
    max_bytes: u32,
    timeout_ms: u32,
}

#[derive(Debug, Serialize)]
struct Destination {
    protocol: &'static str,
    #[serde(rename = "URI")]
    uri: String,
}

/// Subscribes to `platform` telemetry, directing events at `listener_uri`.
///
/// # Errors
///
/// Returns an error if the runtime rejects the subscription.
pub async fn subscribe(
    runtime_api: &str,
    extension_id: &str,
    listener_uri: &str,
) -> Result<(), TelemetryError> {
    let request = SubscriptionRequest {
        schema_version: SCHEMA_VERSION,
        types: vec!["platform"],
        buffering: Buffering {
            max_items: 1000,
            max_bytes: 256 * 1024,
            timeout_ms: 25,
        },
        destination: Destination {
            protocol: "HTTP",
            uri: listener_uri.to_string(),
        },
    };

    let response = reqwest::Client::new()
        .put(format!("http://{runtime_api}{SUBSCRIBE_PATH}"))
        .header(EXTENSION_ID_HEADER, extension_id)
        .json(&request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TelemetryError::Status {
            status: status.as_u16(),
            body,
        });
    }

    tracing::info!(uri = listener_uri, "Subscribed to platform telemetry");
    Ok(())
}

/// Loopback HTTP listener receiving pushed telemetry event batches.
pub struct TelemetryListener {
    port: u16,
    event_tx: mpsc::Sender<PlatformEvent>,
    cancel_token: CancellationToken,
}

impl TelemetryListener {
    /// Creates a listener forwarding parsed events on `event_tx`.
    pub fn new(
        port: u16,
        event_tx: mpsc::Sender<PlatformEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            port,
            event_tx,
            cancel_token,
        }
    }

    /// Returns the URI the Telemetry API should push events to.
    ///
    /// Inside Lambda the sandbox hostname routes to the extension; locally
    /// plain loopback is used.
    pub fn listener_uri(&self) -> String {
        if std::env::var("AWS_LAMBDA_FUNCTION_NAME").is_ok() {
            format!("http://sandbox.localdomain:{}", self.port)
        } else {
            format!("http://127.0.0.1:{}", self.port)
        }
    }

    /// Binds the listener socket and returns the serve future.
    ///
    /// Binding before returning guarantees the port is accepting connections
    /// before the Telemetry API starts delivering events.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn start(
        self,
    ) -> Result<std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>, TelemetryError>
    {
        let app = router(self.event_tx);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr).await.map_err(TelemetryError::Io)?;

        tracing::info!(port = self.port, "Telemetry listener started");

        let cancel_token = self.cancel_token;
        Ok(Box::pin(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(cancel_token.cancelled_owned())
                .await;
        }))
    }
}

pub(crate) fn router(event_tx: mpsc::Sender<PlatformEvent>) -> Router {
    Router::new()
        .route("/", post(handle_telemetry))
        .with_state(Arc::new(event_tx))
}

async fn handle_telemetry(
    State(event_tx): State<Arc<mpsc::Sender<PlatformEvent>>>,
    body: Bytes,
) -> impl IntoResponse {
    let raw: Vec<Value> = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(%error, "Failed to parse telemetry batch");
            return StatusCode::BAD_REQUEST;
        }
    };

    for element in raw {
        let Ok(event) = serde_json::from_value::<RawEvent>(element) else {
            tracing::debug!("Skipping malformed telemetry element");
            continue;
        };
        if let Some(event) = parse_event(event) {
            if event_tx.send(event).await.is_err() {
                tracing::error!("Telemetry event channel closed");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }

    StatusCode::OK
}
