//! Extension runtime: the invocation coordinator.
//!
//! One event loop multiplexes the four input streams over the shared batch:
//! lifecycle events from the Extensions API, agent submissions from the
//! intake server, the agent flush barrier, and platform telemetry.
//!
//! The `/next` long poll doubles as the acknowledgement of the previous
//! event, so it runs in a helper task that only polls when the loop hands it
//! a permit. Under the syncflush strategy the permit is withheld after an
//! `INVOKE` until the invocation is finalized and the batch is shipped;
//! under the background strategy the permit is returned immediately and the
//! batch ships only when ripe or at shutdown.

use crate::accumulator::{AgentPayload, Batch};
use crate::config::{Config, SendStrategy};
use crate::intake::{IntakeError, IntakeServer};
use crate::lifecycle::{LifecycleClient, LifecycleError, NextEvent};
use crate::shipper::{ApmServerClient, ShipError};
use crate::telemetry::{PlatformEvent, TelemetryError, TelemetryListener};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const TELEMETRY_LISTENER_PORT: u16 = 8201;
const AGENT_DATA_CAPACITY: usize = 100;
const TELEMETRY_EVENT_CAPACITY: usize = 64;

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `AWS_LAMBDA_RUNTIME_API` is not set; the extension is not running
    /// inside a Lambda environment.
    #[error("AWS_LAMBDA_RUNTIME_API is not set in the environment")]
    MissingRuntimeApi,

    /// Extensions API failure.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Telemetry API failure.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// Agent intake server failure.
    #[error(transparent)]
    Intake(#[from] IntakeError),

    /// APM server client could not be built.
    #[error(transparent)]
    Ship(#[from] ShipError),

    /// An internal channel closed unexpectedly.
    #[error("coordinator channel closed")]
    ChannelClosed,
}

/// Extension runtime orchestrating all components.
pub struct ExtensionRuntime {
    config: Config,
    cancel_token: CancellationToken,
}

impl ExtensionRuntime {
    /// Creates a runtime with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Returns a handle to the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the extension until shutdown.
    ///
    /// Registers with the Extensions API, subscribes to platform telemetry,
    /// starts the agent intake server, and drives the coordination loop.
    ///
    /// # Errors
    ///
    /// Returns an error if a component fails to start or the Extensions API
    /// long poll fails.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let runtime_api =
            std::env::var("AWS_LAMBDA_RUNTIME_API").map_err(|_| RuntimeError::MissingRuntimeApi)?;

        let batch = Arc::new(Batch::new(
            self.config.max_batch_size,
            self.config.max_batch_age(),
        ));
        let shipper = Arc::new(ApmServerClient::new(&self.config)?);

        let (agent_tx, agent_rx) = mpsc::channel::<AgentPayload>(AGENT_DATA_CAPACITY);
        let (agent_done_tx, agent_done_rx) = mpsc::channel::<()>(1);
        let (telemetry_tx, telemetry_rx) = mpsc::channel::<PlatformEvent>(TELEMETRY_EVENT_CAPACITY);

        let lifecycle = LifecycleClient::register(&runtime_api, &extension_name()).await?;

        let telemetry_listener = TelemetryListener::new(
            TELEMETRY_LISTENER_PORT,
            telemetry_tx,
            self.cancel_token.clone(),
        );
        let listener_uri = telemetry_listener.listener_uri();
        tokio::spawn(telemetry_listener.start().await?);
        crate::telemetry::subscribe(&runtime_api, lifecycle.extension_id(), &listener_uri).await?;

        let intake = IntakeServer::new(
            self.config.data_receiver_server_port,
            agent_tx,
            agent_done_tx,
            Arc::clone(&batch),
            Arc::clone(&shipper),
            self.cancel_token.clone(),
        );
        tokio::spawn(intake.start().await?);

        let coordinator = Coordinator {
            strategy: self.config.send_strategy,
            batch,
            shipper,
            cancel_token: self.cancel_token.clone(),
        };
        let result = coordinator
            .run(lifecycle, agent_rx, agent_done_rx, telemetry_rx)
            .await;

        self.cancel_token.cancel();
        result
    }
}

struct Coordinator {
    strategy: SendStrategy,
    batch: Arc<Batch>,
    shipper: Arc<ApmServerClient>,
    cancel_token: CancellationToken,
}

impl Coordinator {
    async fn run(
        self,
        lifecycle: LifecycleClient,
        mut agent_rx: mpsc::Receiver<AgentPayload>,
        mut agent_done_rx: mpsc::Receiver<()>,
        mut telemetry_rx: mpsc::Receiver<PlatformEvent>,
    ) -> Result<(), RuntimeError> {
        let (permit_tx, mut permit_rx) = mpsc::channel::<()>(1);
        let (lifecycle_tx, mut lifecycle_rx) =
            mpsc::channel::<Result<NextEvent, LifecycleError>>(1);

        // The long poll acknowledges the previous event; it only runs when
        // the loop hands over a permit.
        tokio::spawn(async move {
            while permit_rx.recv().await.is_some() {
                let event = lifecycle.next_event().await;
                let failed = event.is_err();
                if lifecycle_tx.send(event).await.is_err() || failed {
                    break;
                }
            }
        });
        permit_tx
            .send(())
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;

        // Armed with the invocation deadline while a syncflush barrier is up.
        let deadline = tokio::time::sleep(Duration::from_secs(0));
        tokio::pin!(deadline);
        let mut waiting: Option<String> = None;

        loop {
            tokio::select! {
                event = lifecycle_rx.recv() => {
                    let event = event.ok_or(RuntimeError::ChannelClosed)??;
                    match event {
                        NextEvent::Invoke { request_id, invoked_function_arn, deadline_ms } => {
                            tracing::debug!(request_id = %request_id, "Received INVOKE");
                            self.batch.register_invocation(
                                &request_id,
                                &invoked_function_arn,
                                deadline_ms,
                                Utc::now(),
                            );
                            match self.strategy {
                                SendStrategy::SyncFlush => {
                                    deadline.as_mut().reset(
                                        tokio::time::Instant::now() + remaining_until(deadline_ms),
                                    );
                                    waiting = Some(request_id);
                                }
                                SendStrategy::Background => {
                                    if self.batch.should_ship() {
                                        self.ship().await;
                                    }
                                    permit_tx.send(()).await.map_err(|_| RuntimeError::ChannelClosed)?;
                                }
                            }
                        }
                        NextEvent::Shutdown { shutdown_reason, .. } => {
                            tracing::info!(reason = %shutdown_reason, "Received SHUTDOWN");
                            self.drain_agent_data(&mut agent_rx);
                            if let Err(error) = self.batch.on_shutdown(shutdown_status(&shutdown_reason)) {
                                tracing::warn!(%error, "Failed to finalize invocations at shutdown");
                            }
                            self.ship().await;
                            self.cancel_token.cancel();
                            return Ok(());
                        }
                    }
                }
                Some(payload) = agent_rx.recv() => {
                    self.buffer_agent_data(payload);
                    if self.strategy == SendStrategy::Background && self.batch.should_ship() {
                        self.ship().await;
                    }
                }
                Some(event) = telemetry_rx.recv() => {
                    if self.handle_platform_event(event, &mut waiting) {
                        self.drain_agent_data(&mut agent_rx);
                        self.ship().await;
                        permit_tx.send(()).await.map_err(|_| RuntimeError::ChannelClosed)?;
                    } else if self.strategy == SendStrategy::Background && self.batch.should_ship() {
                        self.ship().await;
                    }
                }
                Some(()) = agent_done_rx.recv() => {
                    if waiting.take().is_some() {
                        self.drain_agent_data(&mut agent_rx);
                        self.ship().await;
                        permit_tx.send(()).await.map_err(|_| RuntimeError::ChannelClosed)?;
                    }
                }
                () = &mut deadline, if waiting.is_some() => {
                    tracing::warn!(
                        request_id = waiting.as_deref().unwrap_or_default(),
                        "Invocation deadline reached before runtimeDone; flushing",
                    );
                    waiting = None;
                    self.drain_agent_data(&mut agent_rx);
                    self.ship().await;
                    permit_tx.send(()).await.map_err(|_| RuntimeError::ChannelClosed)?;
                }
            }
        }
    }

    /// Handles one platform telemetry event. Returns true when a withheld
    /// `/next` permit must be released.
    fn handle_platform_event(&self, event: PlatformEvent, waiting: &mut Option<String>) -> bool {
        match event {
            PlatformEvent::InitReport { duration_ms } => {
                tracing::debug!(duration_ms, "Recorded cold start duration");
                self.batch.on_platform_init_report(duration_ms);
                false
            }
            PlatformEvent::RuntimeDone {
                request_id,
                status,
                time,
            } => {
                if let Err(error) = self.batch.on_runtime_done(&request_id, &status, time) {
                    tracing::warn!(%error, request_id = %request_id, "Failed to finalize invocation");
                }
                if waiting.as_deref() == Some(request_id.as_str()) {
                    *waiting = None;
                    return true;
                }
                false
            }
            PlatformEvent::Report {
                request_id,
                billed_duration_ms,
            } => {
                // Tolerant of a record already deleted by shutdown.
                match self.batch.on_platform_report(&request_id) {
                    Ok((function_arn, _deadline_ms, timestamp)) => {
                        tracing::debug!(
                            request_id = %request_id,
                            function_arn = %function_arn,
                            started_at = %timestamp,
                            billed_duration_ms,
                            "Invocation reported",
                        );
                    }
                    Err(_) => {
                        tracing::debug!(request_id = %request_id, "Report for unknown invocation");
                    }
                }
                false
            }
        }
    }

    fn buffer_agent_data(&self, payload: AgentPayload) {
        if let Err(error) = self.batch.add_agent_data(payload) {
            tracing::warn!(%error, "Failed to buffer agent data");
        }
    }

    /// Captures agent data still queued before a flush, without blocking.
    fn drain_agent_data(&self, agent_rx: &mut mpsc::Receiver<AgentPayload>) {
        while let Ok(payload) = agent_rx.try_recv() {
            self.buffer_agent_data(payload);
        }
    }

    /// Ships the buffered document. On failure the batch is left untouched
    /// so the bytes are retried on the next opportunity.
    async fn ship(&self) {
        if self.batch.count() == 0 {
            return;
        }
        let document = self.batch.snapshot();
        match self.shipper.ship(&document).await {
            Ok(_) => self.batch.reset(),
            Err(error) => {
                tracing::warn!(%error, "Failed to ship batch; keeping data for retry");
            }
        }
    }
}

fn shutdown_status(reason: &str) -> &'static str {
    match reason {
        "spindown" => "success",
        "timeout" => "timeout",
        _ => "failure",
    }
}

fn remaining_until(deadline_ms: i64) -> Duration {
    let now_ms = Utc::now().timestamp_millis();
    Duration::from_millis(deadline_ms.saturating_sub(now_ms).max(0) as u64)
}

fn extension_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}
