//! Synthetic span events modelling the Lambda lifecycle phases.
//!
//! When a cold start is attributed to a transaction, two spans are fabricated
//! around it: one covering the sandbox initialisation and one covering the
//! handler execution.

use serde_json::json;

/// Which lifecycle phase a synthetic span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpanKind {
    /// Sandbox initialisation ("AWS Lambda Initialize").
    Init,
    /// Handler execution ("AWS Lambda Handle").
    Handle,
}

impl SpanKind {
    fn name(self) -> &'static str {
        match self {
            SpanKind::Init => "AWS Lambda Initialize",
            SpanKind::Handle => "AWS Lambda Handle",
        }
    }

    fn subtype(self) -> &'static str {
        match self {
            SpanKind::Init => "init",
            SpanKind::Handle => "handle",
        }
    }
}

/// Builds a synthetic span event as an ND-JSON line.
///
/// The span id is a fresh random 64-bit id; parent and transaction ids are
/// inherited from the enclosing transaction. `timestamp` is in
/// microseconds-epoch, `duration` in milliseconds.
pub(crate) fn lambda_span(
    kind: SpanKind,
    transaction_id: &str,
    trace_id: &str,
    timestamp: i64,
    duration: f64,
) -> serde_json::Value {
    let span_id = format!("{:016x}", rand::random::<u64>());
    json!({
        "span": {
            "name": kind.name(),
            "type": "awslambda",
            "subtype": kind.subtype(),
            "id": span_id,
            "transaction_id": transaction_id,
            "parent_id": transaction_id,
            "trace_id": trace_id,
            "timestamp": timestamp,
            "duration": duration,
            "sample_rate": 1.0,
        }
    })
}
