//! AWS Lambda extension relaying Elastic APM agent telemetry to an APM
//! server.
//!
//! The extension runs as a sidecar process in the function sandbox. It
//! listens on loopback for agent submissions, registers with the Lambda
//! Extensions API, subscribes to platform telemetry, correlates both streams
//! per invocation, and forwards batched ND-JSON telemetry with bounded
//! buffering and a configurable flush discipline.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accumulator;
pub mod config;
pub mod error;
pub mod intake;
pub mod lifecycle;
pub mod runtime;
pub mod shipper;
pub mod telemetry;

pub use accumulator::{AgentPayload, Batch, BatchError, Invocation};
pub use config::{Config, SendStrategy};
pub use error::{ExtensionError, Result};
pub use intake::{IntakeError, IntakeServer};
pub use lifecycle::{LifecycleClient, LifecycleError, NextEvent};
pub use runtime::{ExtensionRuntime, RuntimeError};
pub use shipper::{ApmServerClient, ShipError, ShipResult};
pub use telemetry::{PlatformEvent, TelemetryError, TelemetryListener};
