//! Telemetry accumulation: the invocation registry, the shared ND-JSON
//! batch, and the synthesis of events the agent could not produce itself
//! (proxy transactions, cold-start spans).

mod batch;
mod invocation;
mod payload;
mod span;

pub use batch::{Batch, BatchError};
pub use invocation::Invocation;
pub use payload::AgentPayload;
