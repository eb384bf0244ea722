//! Outbound client for the APM server.
//!
//! Ships the accumulated ND-JSON document to the intake endpoint and proxies
//! agent info requests to the server root. A failed ship leaves the batch
//! untouched so the bytes are retried on the next opportunity.

use crate::config::Config;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use std::io::Write;
use thiserror::Error;

const INTAKE_PATH: &str = "/intake/v2/events";

/// Errors from shipping data to the APM server.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ShipError {
    /// The HTTP request failed.
    #[error("request to APM server failed")]
    Http(#[from] reqwest::Error),

    /// The APM server answered with a non-success status.
    #[error("APM server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The request body could not be compressed.
    #[error("failed to compress intake body")]
    Compress(#[source] std::io::Error),
}

/// Outcome of a ship attempt.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipResult {
    /// The document was accepted by the APM server.
    Shipped,
    /// No APM server is configured; the document was dropped.
    Skipped,
}

enum Auth {
    SecretToken(String),
    ApiKey(String),
}

impl Auth {
    fn from_config(config: &Config) -> Option<Self> {
        // An API key wins when both credentials are configured.
        if let Some(key) = &config.api_key {
            return Some(Auth::ApiKey(key.clone()));
        }
        config
            .secret_token
            .as_ref()
            .map(|token| Auth::SecretToken(token.clone()))
    }

    fn header_value(&self) -> String {
        match self {
            Auth::SecretToken(token) => format!("Bearer {token}"),
            Auth::ApiKey(key) => format!("ApiKey {key}"),
        }
    }
}

/// HTTP client for the remote APM server.
pub struct ApmServerClient {
    client: reqwest::Client,
    server_url: Option<String>,
    auth: Option<Auth>,
}

impl ApmServerClient {
    /// Creates a client from the extension configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, ShipError> {
        let client = reqwest::Client::builder()
            .timeout(config.data_receiver_timeout())
            .build()?;

        Ok(Self {
            client,
            server_url: config
                .lambda_apm_server
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            auth: Auth::from_config(config),
        })
    }

    /// Ships an ND-JSON document to the intake endpoint.
    ///
    /// The body is gzip-compressed. On any error the caller must keep the
    /// batch so the same bytes are re-sent later.
    pub async fn ship(&self, document: &[u8]) -> Result<ShipResult, ShipError> {
        let Some(server_url) = &self.server_url else {
            tracing::warn!("No APM server configured, dropping batch");
            return Ok(ShipResult::Skipped);
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(document).map_err(ShipError::Compress)?;
        let body = encoder.finish().map_err(ShipError::Compress)?;

        let mut request = self
            .client
            .post(format!("{server_url}{INTAKE_PATH}"))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header(CONTENT_ENCODING, "gzip")
            .body(body);
        if let Some(auth) = &self.auth {
            request = request.header(AUTHORIZATION, auth.header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShipError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(bytes = document.len(), "Shipped batch to APM server");
        Ok(ShipResult::Shipped)
    }

    /// Forwards an agent info request to the APM server root, mirroring
    /// method and headers.
    ///
    /// # Errors
    ///
    /// Returns the transport error; the intake handler logs it and answers
    /// the agent with an empty response rather than propagating it.
    pub async fn forward_info(
        &self,
        method: reqwest::Method,
        headers: reqwest::header::HeaderMap,
    ) -> Result<reqwest::Response, ShipError> {
        let Some(server_url) = &self.server_url else {
            return Err(ShipError::Status {
                status: 0,
                body: "no APM server configured".to_string(),
            });
        };

        // Opaque passthrough: the agent's own headers travel as-is, auth
        // included.
        let mut request = self.client.request(method, server_url);
        for (name, value) in &headers {
            if *name != reqwest::header::HOST {
                request = request.header(name, value);
            }
        }

        Ok(request.send().await?)
    }
}
