//! End-to-end accumulator scenarios: full invocation lifecycles driven
//! through the batch public API.

use apm_lambda_extension::{AgentPayload, Batch, BatchError};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;

const METADATA_LINE: &[u8] = br#"{"metadata":{}}"#;
const TRANSACTION_LINE: &[u8] = br#"{"transaction":{"id":"t1","timestamp":5000,"duration":2.0}}"#;

fn batch() -> Batch {
    Batch::new(100, Duration::from_secs(2))
}

fn identity(body: Vec<u8>) -> AgentPayload {
    AgentPayload {
        data: body,
        content_encoding: String::new(),
    }
}

fn epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).unwrap()
}

fn lines(buf: &[u8]) -> Vec<Vec<u8>> {
    buf.split(|&c| c == b'\n').map(<[u8]>::to_vec).collect()
}

#[test]
fn happy_path_ships_agent_data_verbatim() {
    let batch = batch();
    batch.register_invocation("A", "arn:aws:lambda:fn", 10_000, epoch_ms(0));

    let mut body = METADATA_LINE.to_vec();
    body.push(b'\n');
    body.extend_from_slice(TRANSACTION_LINE);
    batch.add_agent_data(identity(body)).unwrap();

    batch.on_runtime_done("A", "success", epoch_ms(5)).unwrap();
    let (arn, deadline_ms, _ts) = batch.on_platform_report("A").unwrap();

    let mut expected = METADATA_LINE.to_vec();
    expected.push(b'\n');
    expected.extend_from_slice(TRANSACTION_LINE);
    assert_eq!(batch.snapshot(), expected);
    assert_eq!(batch.size(), 0);
    assert_eq!(arn, "arn:aws:lambda:fn");
    assert_eq!(deadline_ms, 10_000);
}

#[test]
fn cold_start_produces_init_handle_and_adjusted_transaction() {
    let batch = batch();
    batch.register_invocation("A", "arn:aws:lambda:fn", 10_000, epoch_ms(0));
    batch.on_platform_init_report(100.0);

    let mut body = METADATA_LINE.to_vec();
    body.push(b'\n');
    body.extend_from_slice(TRANSACTION_LINE);
    batch.add_agent_data(identity(body)).unwrap();

    let buf = batch.snapshot();
    let lines = lines(&buf);
    assert_eq!(lines.len(), 4);

    let init: Value = serde_json::from_slice(&lines[1]).unwrap();
    assert_eq!(init["span"]["name"], "AWS Lambda Initialize");
    assert_eq!(init["span"]["subtype"], "init");
    assert_eq!(init["span"]["timestamp"], -95_000);
    assert_eq!(init["span"]["duration"], 100.0);

    let handle: Value = serde_json::from_slice(&lines[2]).unwrap();
    assert_eq!(handle["span"]["name"], "AWS Lambda Handle");
    assert_eq!(handle["span"]["subtype"], "handle");
    assert_eq!(handle["span"]["timestamp"], 5_000);
    assert_eq!(handle["span"]["duration"], 2.0);

    let tx: Value = serde_json::from_slice(&lines[3]).unwrap();
    assert_eq!(tx["transaction"]["timestamp"], -95_000);
    assert_eq!(tx["transaction"]["duration"], 102.0);
    assert_eq!(
        tx["transaction"]["context"]["tags"]["aws_lambda_init_duration"],
        100.0
    );
}

#[test]
fn missing_transaction_is_synthesized_on_runtime_done() {
    let batch = batch();
    batch.register_invocation("A", "arn:aws:lambda:fn", 10_000, epoch_ms(0));
    batch
        .on_agent_init("A", "t1", br#"{"transaction":{"id":"t1"}}"#)
        .unwrap();
    batch.add_agent_data(identity(METADATA_LINE.to_vec())).unwrap();

    batch.on_runtime_done("A", "failure", epoch_ms(10)).unwrap();

    let buf = batch.snapshot();
    let lines = lines(&buf);
    assert_eq!(lines.len(), 2);
    let tx: Value = serde_json::from_slice(&lines[1]).unwrap();
    assert_eq!(tx["transaction"]["id"], "t1");
    assert_eq!(tx["transaction"]["result"], "failure");
    assert_eq!(tx["transaction"]["outcome"], "failure");
    assert_eq!(tx["transaction"]["duration"], 10.0);
}

#[test]
fn early_agent_init_survives_the_invoke_event() {
    let batch = batch();
    batch
        .on_agent_init("A", "t1", br#"{"transaction":{"id":"t1"}}"#)
        .unwrap();
    assert_eq!(batch.size(), 1);

    batch.register_invocation("A", "arn:aws:lambda:fn", 10_000, epoch_ms(0));
    assert_eq!(batch.size(), 1);
    batch.add_agent_data(identity(METADATA_LINE.to_vec())).unwrap();

    // The registration payload was kept: finalizing without an observed
    // transaction still yields a proxy.
    batch.on_runtime_done("A", "success", epoch_ms(7)).unwrap();
    let (arn, _deadline_ms, _ts) = batch.on_platform_report("A").unwrap();

    assert_eq!(arn, "arn:aws:lambda:fn");
    let buf = batch.snapshot();
    let lines = lines(&buf);
    assert_eq!(lines.len(), 2);
    let tx: Value = serde_json::from_slice(&lines[1]).unwrap();
    assert_eq!(tx["transaction"]["outcome"], "success");
}

#[test]
fn shutdown_finalizes_every_live_invocation_with_its_deadline() {
    let batch = batch();
    batch.register_invocation("A", "arn:a", 1_000, epoch_ms(0));
    batch
        .on_agent_init("A", "t1", br#"{"transaction":{"id":"t1"}}"#)
        .unwrap();
    batch.register_invocation("B", "arn:b", 2_000, epoch_ms(0));
    batch
        .on_agent_init("B", "t2", br#"{"transaction":{"id":"t2"}}"#)
        .unwrap();
    batch.add_agent_data(identity(METADATA_LINE.to_vec())).unwrap();

    batch.on_shutdown("timeout").unwrap();

    assert_eq!(batch.size(), 0);
    let buf = batch.snapshot();
    let lines = lines(&buf);
    assert_eq!(lines.len(), 3);

    let mut durations: Vec<f64> = lines[1..]
        .iter()
        .map(|line| {
            let tx: Value = serde_json::from_slice(line).unwrap();
            assert_eq!(tx["transaction"]["result"], "timeout");
            tx["transaction"]["duration"].as_f64().unwrap()
        })
        .collect();
    durations.sort_by(f64::total_cmp);
    assert_eq!(durations, vec![1_000.0, 2_000.0]);
}

#[test]
fn batch_fills_at_max_size_and_ripens_at_ninety_percent() {
    let batch = Batch::new(10, Duration::from_secs(60));
    batch.register_invocation("A", "arn:aws:lambda:fn", 10_000, epoch_ms(0));
    batch.add_agent_data(identity(METADATA_LINE.to_vec())).unwrap();

    for i in 0..9 {
        let event = format!("{{\"span\":{{\"id\":\"{i}\"}}}}");
        if i == 8 {
            assert!(!batch.should_ship());
        }
        batch.add_lambda_data(event.as_bytes()).unwrap();
    }
    assert!(batch.should_ship());

    batch.add_lambda_data(b"{\"span\":{\"id\":\"9\"}}").unwrap();
    let err = batch.add_lambda_data(b"{\"span\":{\"id\":\"10\"}}").unwrap_err();
    assert!(matches!(err, BatchError::BatchFull));
    assert_eq!(batch.count(), 10);
}
