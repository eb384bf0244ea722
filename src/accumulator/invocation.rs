//! Per-request invocation state.

use super::batch::BatchError;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// State tracked for a single function invocation, keyed by request id.
///
/// A record is created on whichever arrives first: the `INVOKE` lifecycle
/// event or the agent's transaction registration. It is removed by the
/// matching `platform.report` event or during shutdown.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// Request id issued by the Lambda platform.
    pub request_id: String,
    /// ARN of the invoked function version; empty until `INVOKE` is seen.
    pub function_arn: String,
    /// Absolute wall-clock deadline in milliseconds-epoch.
    pub deadline_ms: i64,
    /// Wall time at which the invocation was observed.
    pub timestamp: DateTime<Utc>,
    /// Transaction id announced by the agent before user code ran; empty if
    /// the agent never registered.
    pub transaction_id: String,
    /// The agent's registration payload, used as the template for a proxy
    /// transaction if the real one never arrives.
    pub agent_payload: Vec<u8>,
    /// True once the agent reported a transaction matching `transaction_id`.
    pub transaction_observed: bool,
    /// True once the invocation has been closed out.
    pub finalized: bool,
}

impl Invocation {
    /// Reports whether a proxy transaction is still outstanding: the agent
    /// registered a transaction id but the matching event was never seen.
    pub fn needs_proxy_transaction(&self) -> bool {
        !self.transaction_id.is_empty() && !self.transaction_observed
    }

    /// Builds a proxy transaction from the registration payload.
    ///
    /// Returns `None` when no proxy is needed: the real transaction was
    /// observed, or the agent never registered one.
    ///
    /// The template's result, duration and outcome are overwritten from the
    /// terminal `status` and the end `time` of the invocation.
    pub(crate) fn create_proxy_transaction(
        &self,
        status: &str,
        time: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>, BatchError> {
        if !self.needs_proxy_transaction() || self.agent_payload.is_empty() {
            return Ok(None);
        }

        let mut root: Value = serde_json::from_slice(&self.agent_payload)?;
        let duration_ms = (time - self.timestamp)
            .num_microseconds()
            .map_or(0.0, |us| us as f64 / 1_000.0);
        let outcome = if status == "success" {
            "success"
        } else {
            "failure"
        };

        let tx = root
            .get_mut("transaction")
            .and_then(Value::as_object_mut)
            .ok_or(BatchError::InvalidPayload)?;
        tx.insert("result".to_string(), Value::from(status));
        tx.insert("duration".to_string(), Value::from(duration_ms));
        tx.insert("outcome".to_string(), Value::from(outcome));

        Ok(Some(serde_json::to_vec(&root)?))
    }
}
