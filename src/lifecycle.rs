//! Lambda Extensions API client.
//!
//! Registers the extension with the runtime and long-polls the `/next`
//! endpoint for lifecycle events. Calling [`LifecycleClient::next_event`]
//! again acknowledges the previous event, so the coordinator withholds that
//! call until it is ready to let the sandbox freeze.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const API_VERSION: &str = "2020-01-01";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors from the Extensions API.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The HTTP request failed.
    #[error("extensions API request failed")]
    Http(#[from] reqwest::Error),

    /// The runtime answered with a non-success status.
    #[error("extensions API returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The register response carried no extension identifier.
    #[error("register response is missing the extension identifier")]
    MissingExtensionId,
}

/// Registration request body.
#[derive(Debug, Serialize)]
struct RegisterRequest {
    events: Vec<&'static str>,
}

/// A lifecycle event returned by the `/next` long poll.
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "eventType")]
pub enum NextEvent {
    /// A function invocation has started.
    #[serde(rename = "INVOKE", rename_all = "camelCase")]
    Invoke {
        /// Request id of the invocation.
        request_id: String,
        /// ARN of the invoked function version.
        invoked_function_arn: String,
        /// Absolute invocation deadline in milliseconds-epoch.
        deadline_ms: i64,
    },
    /// The execution environment is shutting down.
    #[serde(rename = "SHUTDOWN", rename_all = "camelCase")]
    Shutdown {
        /// Why the environment is going away (`spindown`, `timeout`,
        /// `failure`).
        shutdown_reason: String,
        /// Deadline for shutdown work in milliseconds-epoch.
        deadline_ms: i64,
    },
}

/// Client for the Lambda Extensions API.
pub struct LifecycleClient {
    client: reqwest::Client,
    base_url: String,
    extension_id: String,
}

impl LifecycleClient {
    /// Registers the extension for `INVOKE` and `SHUTDOWN` events.
    ///
    /// `runtime_api` is the host:port value of `AWS_LAMBDA_RUNTIME_API`.
    ///
    /// # Errors
    ///
    /// Returns an error if registration fails or the response carries no
    /// extension identifier.
    pub async fn register(runtime_api: &str, extension_name: &str) -> Result<Self, LifecycleError> {
        // The /next long poll parks across sandbox freezes, so the client
        // must not carry a request timeout.
        let client = reqwest::Client::new();
        let base_url = format!("http://{runtime_api}/{API_VERSION}/extension");

        let response = client
            .post(format!("{base_url}/register"))
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&RegisterRequest {
                events: vec!["INVOKE", "SHUTDOWN"],
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LifecycleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(LifecycleError::MissingExtensionId)?
            .to_string();

        tracing::info!(extension_id = %extension_id, "Registered with Extensions API");

        Ok(Self {
            client,
            base_url,
            extension_id,
        })
    }

    /// Returns the identifier assigned at registration.
    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    /// Long-polls for the next lifecycle event.
    ///
    /// Blocks until the runtime delivers an event; the sandbox may freeze
    /// while this call is parked.
    pub async fn next_event(&self) -> Result<NextEvent, LifecycleError> {
        let response = self
            .client
            .get(format!("{}/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, &self.extension_id)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LifecycleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}
