//! Telemetry batch: invocation registry, ND-JSON event buffer and flush
//! predicate behind a single readers-writer lock.

use super::invocation::Invocation;
use super::payload::{self, AgentPayload};
use super::span::{self, SpanKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

const MAX_SIZE_THRESHOLD: f64 = 0.9;

/// Errors from batch ingestion and lifecycle operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BatchError {
    /// The batch has reached full capacity and cannot accept more entries.
    #[error("batch is full")]
    BatchFull,

    /// An event was appended before any metadata line was seen.
    #[error("metadata is not yet available")]
    MetadataUnavailable,

    /// The payload carried an unsupported `Content-Encoding`.
    #[error("unsupported content encoding {0:?}")]
    InvalidEncoding(String),

    /// A compressed payload could not be decompressed.
    #[error("failed to decompress payload")]
    Decompress(#[source] std::io::Error),

    /// The agent registration payload is not a transaction event.
    #[error("invalid payload")]
    InvalidPayload,

    /// A lifecycle event referenced a request id the registry does not know.
    #[error("invocation for request id {0} does not exist")]
    UnknownRequest(String),

    /// Agent data arrived while no invocation was designated current.
    #[error("lifecycle error: currently executing request id is not set")]
    NoCurrentInvocation,

    /// An event that had to be rewritten was not valid JSON.
    #[error("malformed event")]
    Json(#[from] serde_json::Error),
}

/// Accumulates telemetry that has not yet been shipped to the APM server.
///
/// The batch holds every live invocation, correlates them with the data
/// collected from the agent and the platform telemetry stream, and decides
/// when the buffered ND-JSON document is ripe for shipping.
///
/// All state lives behind one readers-writer lock. The internal append path
/// never re-enters the public API, so synthesized spans can be written from
/// within a writer section.
pub struct Batch {
    max_size: usize,
    max_age: Duration,
    inner: RwLock<Inner>,
}

struct Inner {
    /// Length of the cached metadata line at the start of `buf`.
    metadata_len: usize,
    /// ND-JSON output buffer: metadata line, then `\n`-prefixed events.
    buf: Vec<u8>,
    invocations: HashMap<String, Invocation>,
    count: usize,
    age: Option<Instant>,
    /// Request id of the invocation agent data is attributed to. Set on
    /// either the `INVOKE` event or the agent registration, whichever
    /// arrives first.
    currently_executing: Option<String>,
    /// Init duration from the last `platform.initReport`; negative when
    /// there is no cold start left to attribute.
    coldstart_duration_ms: f64,
}

impl Batch {
    /// Creates a batch accepting at most `max_size` events, considered ripe
    /// once older than `max_age`.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            max_size,
            max_age,
            inner: RwLock::new(Inner {
                metadata_len: 0,
                buf: Vec::new(),
                invocations: HashMap::new(),
                count: 0,
                age: None,
                currently_executing: None,
                coldstart_duration_ms: -1.0,
            }),
        }
    }

    /// Returns the number of live invocations in the registry.
    pub fn size(&self) -> usize {
        self.inner.read().invocations.len()
    }

    /// Returns the number of events appended since the last reset.
    pub fn count(&self) -> usize {
        self.inner.read().count
    }

    /// Registers a function invocation and marks it as currently executing.
    ///
    /// An existing record (created by an early agent registration) is
    /// updated in place without discarding the agent fields.
    pub fn register_invocation(
        &self,
        request_id: &str,
        function_arn: &str,
        deadline_ms: i64,
        timestamp: DateTime<Utc>,
    ) {
        let mut inner = self.inner.write();
        let inv = inner
            .invocations
            .entry(request_id.to_string())
            .or_default();
        inv.request_id = request_id.to_string();
        inv.function_arn = function_arn.to_string();
        inv.deadline_ms = deadline_ms;
        inv.timestamp = timestamp;
        inner.currently_executing = Some(request_id.to_string());
    }

    /// Caches the transaction id and registration payload announced by the
    /// agent before user code runs.
    ///
    /// The record is created if the `INVOKE` event has not arrived yet, and
    /// the request becomes the currently executing one either way. The
    /// payload is kept as the template for a proxy transaction in case the
    /// real transaction is never reported.
    pub fn on_agent_init(
        &self,
        request_id: &str,
        transaction_id: &str,
        agent_payload: &[u8],
    ) -> Result<(), BatchError> {
        if !payload::is_transaction_event(agent_payload) {
            return Err(BatchError::InvalidPayload);
        }
        let mut inner = self.inner.write();
        let inv = inner
            .invocations
            .entry(request_id.to_string())
            .or_default();
        inv.request_id = request_id.to_string();
        inv.transaction_id = transaction_id.to_string();
        inv.agent_payload = agent_payload.to_vec();
        inner.currently_executing = Some(request_id.to_string());
        Ok(())
    }

    /// Drains an agent intake payload into the buffer.
    ///
    /// The body is decompressed, split into ND-JSON lines, and appended in
    /// input order under the currently executing invocation. The first line
    /// is the payload's metadata: it becomes the cached metadata line if none
    /// is set, and is silently dropped otherwise.
    ///
    /// A full batch is rejected before any work, but a drain that has begun
    /// appends all of its events even past the size limit.
    pub fn add_agent_data(&self, data: AgentPayload) -> Result<(), BatchError> {
        if data.data.is_empty() {
            return Ok(());
        }
        let raw = payload::uncompressed(&data.data, &data.content_encoding)?;

        let mut inner = self.inner.write();
        if inner.count >= self.max_size {
            return Err(BatchError::BatchFull);
        }
        let current = inner
            .currently_executing
            .clone()
            .ok_or(BatchError::NoCurrentInvocation)?;
        if !inner.invocations.contains_key(&current) {
            return Err(BatchError::UnknownRequest(current));
        }

        let (metadata, mut rest) = payload::cut_line(&raw);
        if inner.metadata_len == 0 {
            inner.buf.extend_from_slice(metadata);
            inner.metadata_len = metadata.len();
        }
        loop {
            let (event, after) = payload::cut_line(rest);
            let is_tx = payload::is_transaction_event(event);
            if is_tx && inner.expects_proxy(&current) {
                if let Some(id) = transaction_id_of(event) {
                    if let Some(inv) = inner.invocations.get_mut(&current) {
                        if !id.is_empty() && inv.transaction_id == id {
                            inv.transaction_observed = true;
                        }
                    }
                }
            }
            inner.append_one(event, is_tx)?;
            if after.is_empty() {
                break;
            }
            rest = after;
        }
        Ok(())
    }

    /// Appends a single event produced by the extension itself.
    pub fn add_lambda_data(&self, event: &[u8]) -> Result<(), BatchError> {
        let mut inner = self.inner.write();
        if inner.count >= self.max_size {
            return Err(BatchError::BatchFull);
        }
        inner.append_one(event, false)
    }

    /// Closes out an invocation on `platform.runtimeDone`, synthesizing a
    /// proxy transaction if the agent-registered one never arrived.
    pub fn on_runtime_done(
        &self,
        request_id: &str,
        status: &str,
        time: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        self.inner.write().finalize_invocation(request_id, status, time)
    }

    /// Removes the invocation on `platform.report` and returns its
    /// `(function_arn, deadline_ms, timestamp)` enrichment tuple.
    pub fn on_platform_report(
        &self,
        request_id: &str,
    ) -> Result<(String, i64, DateTime<Utc>), BatchError> {
        let mut inner = self.inner.write();
        let inv = inner
            .invocations
            .remove(request_id)
            .ok_or_else(|| BatchError::UnknownRequest(request_id.to_string()))?;
        Ok((inv.function_arn, inv.deadline_ms, inv.timestamp))
    }

    /// Stores the cold-start credit from `platform.initReport`. The next
    /// transaction appended is retroactively adjusted to cover the init
    /// phase.
    pub fn on_platform_init_report(&self, init_duration_ms: f64) {
        self.inner.write().coldstart_duration_ms = init_duration_ms;
    }

    /// Finalizes and removes every surviving invocation.
    ///
    /// The runtime never delivers `platform.runtimeDone` for invocations cut
    /// short by shutdown, so their end time is approximated by the
    /// invocation deadline. Best effort: the first failure aborts, and
    /// records already removed stay removed.
    pub fn on_shutdown(&self, status: &str) -> Result<(), BatchError> {
        let mut inner = self.inner.write();
        let ids: Vec<String> = inner.invocations.keys().cloned().collect();
        for id in ids {
            let deadline_ms = inner
                .invocations
                .get(&id)
                .map(|inv| inv.deadline_ms)
                .unwrap_or_default();
            let time = DateTime::from_timestamp_millis(deadline_ms).unwrap_or_default();
            inner.finalize_invocation(&id, status, time)?;
            inner.invocations.remove(&id);
        }
        Ok(())
    }

    /// Reports whether the batch is ripe for shipping: at least 90% of
    /// capacity used, or older than the configured maximum age.
    pub fn should_ship(&self) -> bool {
        let inner = self.inner.read();
        inner.count >= (self.max_size as f64 * MAX_SIZE_THRESHOLD) as usize
            || inner.age.is_some_and(|age| age.elapsed() > self.max_age)
    }

    /// Returns a copy of the buffered ND-JSON document (metadata line plus
    /// appended events, not newline-terminated).
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.read().buf.clone()
    }

    /// Truncates the buffer back to the metadata line and clears the event
    /// count and age. The metadata line is kept for the process lifetime.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        let metadata_len = inner.metadata_len;
        inner.buf.truncate(metadata_len);
        inner.count = 0;
        inner.age = None;
    }
}

impl Inner {
    fn expects_proxy(&self, request_id: &str) -> bool {
        self.invocations
            .get(request_id)
            .is_some_and(Invocation::needs_proxy_transaction)
    }

    fn finalize_invocation(
        &mut self,
        request_id: &str,
        status: &str,
        time: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        let inv = self
            .invocations
            .get(request_id)
            .ok_or_else(|| BatchError::UnknownRequest(request_id.to_string()))?;
        if let Some(proxy) = inv.create_proxy_transaction(status, time)? {
            self.append_one(&proxy, true)?;
        }
        if let Some(inv) = self.invocations.get_mut(request_id) {
            inv.finalized = true;
        }
        Ok(())
    }

    /// Appends one event line. Callers hold the writer lock; this path must
    /// not re-enter the public API.
    fn append_one(&mut self, event: &[u8], is_tx: bool) -> Result<(), BatchError> {
        if event.is_empty() {
            return Ok(());
        }
        if self.metadata_len == 0 {
            return Err(BatchError::MetadataUnavailable);
        }
        let adjusted;
        let event = if is_tx && self.coldstart_duration_ms >= 0.0 {
            adjusted = self.model_init_phase(event)?;
            adjusted.as_slice()
        } else {
            event
        };
        self.buf.push(b'\n');
        self.buf.extend_from_slice(event);
        if self.count == 0 {
            self.age = Some(Instant::now());
        }
        self.count += 1;
        Ok(())
    }

    /// Attributes the pending cold start to a transaction: shifts its
    /// timestamp back by the init duration, extends its duration, tags it,
    /// and emits init and handle spans ahead of it. Consumes the credit.
    fn model_init_phase(&mut self, tx_data: &[u8]) -> Result<Vec<u8>, BatchError> {
        let init_ms = self.coldstart_duration_ms;
        let mut root: Value = serde_json::from_slice(tx_data)?;

        let old_timestamp = root["transaction"]["timestamp"].as_i64().unwrap_or(0);
        let old_duration = root["transaction"]["duration"].as_f64().unwrap_or(0.0);
        let new_timestamp = old_timestamp - (init_ms * 1_000.0) as i64;
        let new_duration = old_duration + init_ms;
        let transaction_id = root["transaction"]["id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let trace_id = root["transaction"]["trace_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let tx = root
            .get_mut("transaction")
            .and_then(Value::as_object_mut)
            .ok_or(BatchError::InvalidPayload)?;
        tx.insert("timestamp".to_string(), Value::from(new_timestamp));
        tx.insert("duration".to_string(), Value::from(new_duration));
        let tags = ensure_object(ensure_object(tx, "context")?, "tags")?;
        tags.insert(
            "aws_lambda_init_duration".to_string(),
            Value::from(init_ms),
        );

        self.coldstart_duration_ms = -1.0;

        let init = span::lambda_span(
            SpanKind::Init,
            &transaction_id,
            &trace_id,
            new_timestamp,
            init_ms,
        );
        self.append_one(&serde_json::to_vec(&init)?, false)?;

        let handle = span::lambda_span(
            SpanKind::Handle,
            &transaction_id,
            &trace_id,
            old_timestamp,
            old_duration,
        );
        self.append_one(&serde_json::to_vec(&handle)?, false)?;

        Ok(serde_json::to_vec(&root)?)
    }
}

fn transaction_id_of(event: &[u8]) -> Option<String> {
    let root: Value = serde_json::from_slice(event).ok()?;
    root.get("transaction")?
        .get("id")?
        .as_str()
        .map(str::to_string)
}

fn ensure_object<'a>(
    map: &'a mut serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a mut serde_json::Map<String, Value>, BatchError> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(serde_json::Map::new());
    }
    match entry {
        Value::Object(object) => Ok(object),
        _ => Err(BatchError::InvalidPayload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const METADATA: &[u8] = br#"{"metadata":{"service":{"name":"test"}}}"#;

    fn batch() -> Batch {
        Batch::new(100, Duration::from_secs(2))
    }

    fn agent_payload(body: &[u8]) -> AgentPayload {
        AgentPayload {
            data: body.to_vec(),
            content_encoding: String::new(),
        }
    }

    fn epoch_ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn register(b: &Batch, request_id: &str) {
        b.register_invocation(request_id, "arn:test", 600_000, epoch_ms(0));
    }

    #[test]
    fn test_metadata_first_wins() {
        let b = batch();
        register(&b, "a");

        let mut first = METADATA.to_vec();
        first.extend_from_slice(b"\n{\"span\":{\"id\":\"1\"}}");
        b.add_agent_data(agent_payload(&first)).unwrap();

        let mut second = br#"{"metadata":{"service":{"name":"other"}}}"#.to_vec();
        second.extend_from_slice(b"\n{\"span\":{\"id\":\"2\"}}");
        b.add_agent_data(agent_payload(&second)).unwrap();

        let buf = b.snapshot();
        let head = &buf[..buf.iter().position(|&c| c == b'\n').unwrap()];
        assert_eq!(head, METADATA);
        assert_eq!(b.count(), 2);
    }

    #[test]
    fn test_append_preserves_order() {
        let b = batch();
        register(&b, "a");

        let mut body = METADATA.to_vec();
        body.extend_from_slice(b"\n{\"span\":{\"id\":\"1\"}}\n{\"span\":{\"id\":\"2\"}}");
        b.add_agent_data(agent_payload(&body)).unwrap();
        b.add_agent_data(agent_payload(b"{\"metadata\":{}}\n{\"span\":{\"id\":\"3\"}}"))
            .unwrap();

        let buf = b.snapshot();
        let lines: Vec<&[u8]> = buf.split(|&c| c == b'\n').collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], br#"{"span":{"id":"1"}}"#);
        assert_eq!(lines[2], br#"{"span":{"id":"2"}}"#);
        assert_eq!(lines[3], br#"{"span":{"id":"3"}}"#);
    }

    #[test]
    fn test_agent_data_without_current_invocation() {
        let b = batch();
        let mut body = METADATA.to_vec();
        body.extend_from_slice(b"\n{\"span\":{}}");

        let err = b.add_agent_data(agent_payload(&body)).unwrap_err();
        assert!(matches!(err, BatchError::NoCurrentInvocation));
    }

    #[test]
    fn test_lambda_data_requires_metadata() {
        let b = batch();
        let err = b.add_lambda_data(b"{\"log\":{}}").unwrap_err();
        assert!(matches!(err, BatchError::MetadataUnavailable));
    }

    #[test]
    fn test_batch_full_refusal_and_drain_overflow() {
        let b = Batch::new(3, Duration::from_secs(2));
        register(&b, "a");
        b.add_agent_data(agent_payload(METADATA)).unwrap();

        // A drain that starts below the limit may overflow it.
        let mut body = METADATA.to_vec();
        body.extend_from_slice(
            b"\n{\"span\":{\"id\":\"1\"}}\n{\"span\":{\"id\":\"2\"}}\n{\"span\":{\"id\":\"3\"}}\n{\"span\":{\"id\":\"4\"}}",
        );
        b.add_agent_data(agent_payload(&body)).unwrap();
        assert_eq!(b.count(), 4);

        let err = b
            .add_agent_data(agent_payload(b"{\"metadata\":{}}\n{\"span\":{}}"))
            .unwrap_err();
        assert!(matches!(err, BatchError::BatchFull));
        let err = b.add_lambda_data(b"{\"log\":{}}").unwrap_err();
        assert!(matches!(err, BatchError::BatchFull));
    }

    #[test]
    fn test_should_ship_at_size_threshold() {
        let b = Batch::new(10, Duration::from_secs(60));
        register(&b, "a");
        b.add_agent_data(agent_payload(METADATA)).unwrap();

        for i in 0..8 {
            b.add_lambda_data(format!("{{\"span\":{{\"id\":\"{i}\"}}}}").as_bytes())
                .unwrap();
        }
        assert!(!b.should_ship());

        b.add_lambda_data(b"{\"span\":{\"id\":\"8\"}}").unwrap();
        assert_eq!(b.count(), 9);
        assert!(b.should_ship());
    }

    #[test]
    fn test_should_ship_by_age() {
        let b = Batch::new(100, Duration::from_millis(10));
        register(&b, "a");
        b.add_agent_data(agent_payload(METADATA)).unwrap();
        assert!(!b.should_ship());

        let mut body = METADATA.to_vec();
        body.extend_from_slice(b"\n{\"span\":{}}");
        b.add_agent_data(agent_payload(&body)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.should_ship());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let b = batch();
        register(&b, "a");
        let mut body = METADATA.to_vec();
        body.extend_from_slice(b"\n{\"span\":{}}");
        b.add_agent_data(agent_payload(&body)).unwrap();

        b.reset();
        assert_eq!(b.snapshot(), METADATA);
        assert_eq!(b.count(), 0);

        b.reset();
        assert_eq!(b.snapshot(), METADATA);
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn test_proxy_transaction_on_runtime_done() {
        let b = batch();
        register(&b, "a");
        b.on_agent_init("a", "t1", br#"{"transaction":{"id":"t1"}}"#)
            .unwrap();
        b.add_agent_data(agent_payload(METADATA)).unwrap();

        b.on_runtime_done("a", "failure", epoch_ms(10)).unwrap();

        let buf = b.snapshot();
        let lines: Vec<&[u8]> = buf.split(|&c| c == b'\n').collect();
        assert_eq!(lines.len(), 2);
        let root: Value = serde_json::from_slice(lines[1]).unwrap();
        assert_eq!(root["transaction"]["result"], "failure");
        assert_eq!(root["transaction"]["duration"], 10.0);
    }

    #[test]
    fn test_observed_transaction_suppresses_proxy() {
        let b = batch();
        register(&b, "a");
        b.on_agent_init("a", "t1", br#"{"transaction":{"id":"t1"}}"#)
            .unwrap();

        let mut body = METADATA.to_vec();
        body.extend_from_slice(br#"
{"transaction":{"id":"t1","timestamp":5000,"duration":2.0}}"#);
        b.add_agent_data(agent_payload(&body)).unwrap();

        b.on_runtime_done("a", "success", epoch_ms(5)).unwrap();
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_agent_init_rejects_non_transaction() {
        let b = batch();
        let err = b.on_agent_init("a", "t1", br#"{"span":{}}"#).unwrap_err();
        assert!(matches!(err, BatchError::InvalidPayload));
    }

    #[test]
    fn test_agent_init_before_invoke_keeps_agent_fields() {
        let b = batch();
        b.on_agent_init("a", "t1", br#"{"transaction":{"id":"t1"}}"#)
            .unwrap();
        assert_eq!(b.size(), 1);

        b.register_invocation("a", "arn:fn", 600_000, epoch_ms(0));
        assert_eq!(b.size(), 1);

        let (arn, deadline, _ts) = b.on_platform_report("a").unwrap();
        assert_eq!(arn, "arn:fn");
        assert_eq!(deadline, 600_000);
    }

    #[test]
    fn test_platform_report_unknown_request() {
        let b = batch();
        let err = b.on_platform_report("missing").unwrap_err();
        assert!(matches!(err, BatchError::UnknownRequest(_)));
    }

    #[test]
    fn test_cold_start_trio() {
        let b = batch();
        register(&b, "a");
        b.on_platform_init_report(100.0);

        let mut body = METADATA.to_vec();
        body.extend_from_slice(
            br#"
{"transaction":{"id":"t1","trace_id":"tr1","timestamp":5000,"duration":2.0}}"#,
        );
        b.add_agent_data(agent_payload(&body)).unwrap();

        let buf = b.snapshot();
        let lines: Vec<&[u8]> = buf.split(|&c| c == b'\n').collect();
        assert_eq!(lines.len(), 4);

        let init: Value = serde_json::from_slice(lines[1]).unwrap();
        assert_eq!(init["span"]["name"], "AWS Lambda Initialize");
        assert_eq!(init["span"]["timestamp"], -95_000);
        assert_eq!(init["span"]["duration"], 100.0);
        assert_eq!(init["span"]["trace_id"], "tr1");

        let handle: Value = serde_json::from_slice(lines[2]).unwrap();
        assert_eq!(handle["span"]["name"], "AWS Lambda Handle");
        assert_eq!(handle["span"]["timestamp"], 5_000);
        assert_eq!(handle["span"]["duration"], 2.0);

        let tx: Value = serde_json::from_slice(lines[3]).unwrap();
        assert_eq!(tx["transaction"]["timestamp"], -95_000);
        assert_eq!(tx["transaction"]["duration"], 102.0);
        assert_eq!(
            tx["transaction"]["context"]["tags"]["aws_lambda_init_duration"],
            100.0
        );
    }

    #[test]
    fn test_cold_start_credit_is_consumed() {
        let b = batch();
        register(&b, "a");
        b.on_platform_init_report(100.0);

        let mut body = METADATA.to_vec();
        body.extend_from_slice(b"\n{\"transaction\":{\"id\":\"t1\",\"timestamp\":5000,\"duration\":2.0}}");
        b.add_agent_data(agent_payload(&body)).unwrap();
        assert_eq!(b.count(), 3);

        b.add_agent_data(agent_payload(
            b"{\"metadata\":{}}\n{\"transaction\":{\"id\":\"t2\",\"timestamp\":9000,\"duration\":1.0}}",
        ))
        .unwrap();
        // No new synthetic spans for the second transaction.
        assert_eq!(b.count(), 4);
    }

    #[test]
    fn test_shutdown_finalizes_all_invocations() {
        let b = batch();
        b.register_invocation("a", "arn:a", 1_000, epoch_ms(0));
        b.on_agent_init("a", "t1", br#"{"transaction":{"id":"t1"}}"#)
            .unwrap();
        b.register_invocation("b", "arn:b", 2_000, epoch_ms(0));
        b.on_agent_init("b", "t2", br#"{"transaction":{"id":"t2"}}"#)
            .unwrap();
        b.add_agent_data(agent_payload(METADATA)).unwrap();

        b.on_shutdown("timeout").unwrap();

        assert_eq!(b.size(), 0);
        let buf = b.snapshot();
        let lines: Vec<&[u8]> = buf.split(|&c| c == b'\n').collect();
        assert_eq!(lines.len(), 3);

        let mut durations = Vec::new();
        for line in &lines[1..] {
            let root: Value = serde_json::from_slice(line).unwrap();
            assert_eq!(root["transaction"]["result"], "timeout");
            assert_eq!(root["transaction"]["outcome"], "failure");
            durations.push(root["transaction"]["duration"].as_f64().unwrap());
        }
        durations.sort_by(f64::total_cmp);
        assert_eq!(durations, vec![1_000.0, 2_000.0]);
    }

    #[test]
    fn test_single_line_body_is_metadata_only() {
        let b = batch();
        register(&b, "a");
        b.add_agent_data(agent_payload(METADATA)).unwrap();
        assert_eq!(b.count(), 0);
        assert_eq!(b.snapshot(), METADATA);
    }

    #[test]
    fn test_empty_payload_is_noop() {
        let b = batch();
        b.add_agent_data(agent_payload(b"")).unwrap();
        assert_eq!(b.count(), 0);
    }
}
