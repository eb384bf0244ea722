//! Extension configuration.
//!
//! Configuration is a passive record of the recognised `ELASTIC_APM_*`
//! environment variables, merged over compiled-in defaults with figment.
//! Unrecognised `ELASTIC_APM_*` variables are warned about and ignored.
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `ELASTIC_APM_LAMBDA_APM_SERVER` | URL of the remote APM server |
//! | `ELASTIC_APM_SECRET_TOKEN` | Bearer credential |
//! | `ELASTIC_APM_API_KEY` | API-key credential (wins over the secret token) |
//! | `ELASTIC_APM_DATA_RECEIVER_SERVER_PORT` | Loopback port for agent intake (default 8200) |
//! | `ELASTIC_APM_DATA_RECEIVER_TIMEOUT_SECONDS` | Timeout for shipping to the APM server |
//! | `ELASTIC_APM_SEND_STRATEGY` | `syncflush` (default) or `background` |
//! | `ELASTIC_APM_LOG_LEVEL` | Log verbosity |
//! | `ELASTIC_APM_MAX_BATCH_SIZE` | Maximum events buffered per batch |
//! | `ELASTIC_APM_MAX_BATCH_AGE_SECONDS` | Age at which a batch becomes ripe |

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "ELASTIC_APM_";

const RECOGNIZED_OPTIONS: &[&str] = &[
    "LAMBDA_APM_SERVER",
    "SECRET_TOKEN",
    "API_KEY",
    "DATA_RECEIVER_SERVER_PORT",
    "DATA_RECEIVER_TIMEOUT_SECONDS",
    "SEND_STRATEGY",
    "LOG_LEVEL",
    "MAX_BATCH_SIZE",
    "MAX_BATCH_AGE_SECONDS",
];

/// When buffered telemetry is shipped to the APM server.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SendStrategy {
    /// Ship at the end of every invocation, withholding the lifecycle
    /// acknowledgement until the data is out.
    #[default]
    SyncFlush,
    /// Accumulate across invocations; ship only when the batch is ripe or at
    /// shutdown.
    Background,
}

/// Extension configuration loaded from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL of the remote APM server. Shipping is skipped when unset.
    pub lambda_apm_server: Option<String>,
    /// Secret token credential for the APM server.
    pub secret_token: Option<String>,
    /// API key credential for the APM server; wins over the secret token.
    pub api_key: Option<String>,
    /// Loopback port the agent intake server binds to.
    pub data_receiver_server_port: u16,
    /// Timeout in seconds for requests to the APM server.
    pub data_receiver_timeout_seconds: u64,
    /// Flush discipline.
    pub send_strategy: SendStrategy,
    /// Log verbosity, consumed by the tracing subscriber at startup.
    pub log_level: Option<String>,
    /// Maximum events buffered per batch.
    pub max_batch_size: usize,
    /// Age in seconds at which a non-empty batch becomes ripe for shipping.
    pub max_batch_age_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lambda_apm_server: None,
            secret_token: None,
            api_key: None,
            data_receiver_server_port: 8200,
            data_receiver_timeout_seconds: 15,
            send_strategy: SendStrategy::SyncFlush,
            log_level: None,
            max_batch_size: 100,
            max_batch_age_seconds: 2,
        }
    }
}

impl Config {
    /// Loads configuration from `ELASTIC_APM_*` environment variables merged
    /// over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a recognised variable has an unparseable value.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        warn_unrecognized_options();
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
    }

    /// Returns the shipping timeout as a [`Duration`].
    pub fn data_receiver_timeout(&self) -> Duration {
        Duration::from_secs(self.data_receiver_timeout_seconds)
    }

    /// Returns the batch maturity age as a [`Duration`].
    pub fn max_batch_age(&self) -> Duration {
        Duration::from_secs(self.max_batch_age_seconds)
    }
}

fn warn_unrecognized_options() {
    for (name, _) in std::env::vars() {
        if let Some(option) = name.strip_prefix(ENV_PREFIX) {
            if !RECOGNIZED_OPTIONS.contains(&option) {
                tracing::warn!(variable = %name, "Ignoring unrecognised configuration option");
            }
        }
    }
}
