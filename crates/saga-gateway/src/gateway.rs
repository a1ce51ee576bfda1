//! The gateway component: owns the registry and wires admission,
//! subscriptions, catch-up, relay and idle eviction together.

use std::sync::Arc;
use std::time::Duration;

use saga_core::{ConnectionId, EventLog, GatewayError, JobAggregateStore, JobId};
use saga_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::bus::BusSource;
use crate::config::GatewayConfig;
use crate::connection::{ClientConnection, OutboundRx};
use crate::idle::spawn_idle_monitor;
use crate::metrics::GatewaySnapshot;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{GatewayRegistry, Limits};
use crate::relay::BusRelay;
use crate::replay::CatchUpReplayer;
use crate::subscriptions::SubscribeOutcome;

/// Why a connection left the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Client,
    Idle,
    Drain,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Idle => "idle",
            Self::Drain => "drain",
        }
    }
}

/// Background tasks started by [`Gateway::start`].
pub struct GatewayTasks {
    pub relay: JoinHandle<()>,
    pub idle_monitor: Option<JoinHandle<()>>,
}

impl GatewayTasks {
    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.relay];
        handles.extend(self.idle_monitor);
        handles
    }
}

/// One gateway process. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<GatewayRegistry>,
    replayer: Arc<CatchUpReplayer>,
    recorder: Arc<MetricsRecorder>,
    tasks: CancellationToken,
    started_at: Instant,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        event_log: Arc<dyn EventLog>,
        job_store: Arc<dyn JobAggregateStore>,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        let registry = Arc::new(GatewayRegistry::new(Limits {
            max_connections: config.max_connections,
            max_connections_per_origin: config.max_connections_per_origin,
            max_subscriptions_per_client: config.max_subscriptions_per_client,
        }));
        let replayer = Arc::new(CatchUpReplayer::new(
            event_log,
            job_store,
            config.replay_limit(),
            config.replay_warn_threshold(),
            Arc::clone(&recorder),
        ));
        Self {
            config: Arc::new(config),
            registry,
            replayer,
            recorder,
            tasks: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Spawn the bus relay and, unless eviction is disabled, the idle monitor.
    pub fn start<S>(&self, bus: S) -> GatewayTasks
    where
        S: BusSource + 'static,
    {
        let relay = BusRelay::new(Arc::clone(&self.registry), Arc::clone(&self.recorder))
            .spawn(bus, self.tasks.child_token());
        let idle_monitor = self.config.idle_timeout().map(|_| {
            spawn_idle_monitor(
                self.clone(),
                self.config.idle_sweep_interval(),
                self.tasks.child_token(),
            )
        });
        info!(
            max_connections = self.config.max_connections,
            max_connections_per_origin = self.config.max_connections_per_origin,
            max_subscriptions_per_client = self.config.max_subscriptions_per_client,
            idle_timeout_ms = self.config.idle_timeout_ms,
            "gateway started"
        );
        GatewayTasks { relay, idle_monitor }
    }

    /// Admit a new client. On success returns the connection and the
    /// receiving end of its outbound queue.
    pub fn connect(&self, origin: &str) -> Result<(Arc<ClientConnection>, OutboundRx), GatewayError> {
        let (conn, rx) = ClientConnection::open(ConnectionId::new(), origin, self.config.send_queue_capacity);
        let conn = Arc::new(conn);
        match self.registry.admit(Arc::clone(&conn)) {
            Ok(()) => {
                self.recorder.counter_inc("connections_accepted_total", &[], 1);
                self.recorder.gauge_inc("connections_active", &[], 1);
                info!(conn_id = %conn.id, origin, "connection admitted");
                Ok((conn, rx))
            }
            Err(err) => {
                self.recorder
                    .counter_inc("connections_rejected_total", &[("reason", err.error_kind())], 1);
                warn!(origin, reason = err.error_kind(), error = %err, "connection rejected");
                Err(err)
            }
        }
    }

    /// Dispatch one client text frame. Never waits on the outbound queue,
    /// so the socket reader keeps reading while a catch-up is in flight.
    pub fn handle_text(&self, conn: &Arc<ClientConnection>, text: &str) {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(conn_id = %conn.id, error = %err, "unparsable client frame");
                conn.send_message(&ServerMessage::error(&err, None));
                return;
            }
        };
        conn.touch();
        match message {
            ClientMessage::Subscribe { job_id } => {
                self.subscribe(conn, &job_id);
            }
            ClientMessage::Unsubscribe { job_id } => self.unsubscribe(conn, &job_id),
            ClientMessage::Ping => {
                conn.send_message(&ServerMessage::Pong);
            }
        }
    }

    /// Transport-level heartbeat (websocket ping or pong).
    pub fn heartbeat(&self, conn: &ClientConnection) {
        conn.touch();
    }

    /// Subscribe and acknowledge, then replay history on its own task. Live
    /// events published meanwhile are held back until the replay is done.
    ///
    /// Returns the catch-up task when a new subscription started one.
    #[instrument(skip(self, conn), fields(conn_id = %conn.id))]
    pub fn subscribe(&self, conn: &Arc<ClientConnection>, raw_job_id: &str) -> Option<JoinHandle<()>> {
        let outcome = JobId::parse(raw_job_id)
            .map_err(GatewayError::from)
            .and_then(|job_id| {
                let outcome = self.registry.subscribe(&conn.id, &job_id)?;
                Ok((job_id, outcome))
            });

        match outcome {
            Ok((job_id, SubscribeOutcome::AlreadySubscribed)) => {
                debug!(job_id = %job_id, "already subscribed");
                conn.send_message(&ServerMessage::Subscribed { job_id });
                None
            }
            Ok((job_id, SubscribeOutcome::Added)) => {
                self.recorder.counter_inc("subscriptions_total", &[], 1);
                info!(job_id = %job_id, "subscribed");
                conn.send_message(&ServerMessage::Subscribed { job_id: job_id.clone() });
                Some(self.spawn_catch_up(job_id, Arc::clone(conn)))
            }
            Err(err) => {
                self.recorder
                    .counter_inc("subscriptions_rejected_total", &[("reason", err.error_kind())], 1);
                warn!(job_id = raw_job_id, reason = err.error_kind(), error = %err, "subscription rejected");
                conn.send_message(&ServerMessage::error(&err, Some(raw_job_id)));
                None
            }
        }
    }

    /// Replay stops by itself once the connection closes or the job is
    /// unsubscribed.
    fn spawn_catch_up(&self, job_id: JobId, conn: Arc<ClientConnection>) -> JoinHandle<()> {
        let replayer = Arc::clone(&self.replayer);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let record = replayer.replay(&job_id, &conn).await;
            registry.record_catch_up(record);
        })
    }

    /// Always acknowledged, whether or not the subscription existed.
    pub fn unsubscribe(&self, conn: &ClientConnection, raw_job_id: &str) {
        let job_id = match JobId::parse(raw_job_id) {
            Ok(job_id) => job_id,
            Err(e) => {
                let err = GatewayError::from(e);
                conn.send_message(&ServerMessage::error(&err, Some(raw_job_id)));
                return;
            }
        };
        let removed = self.registry.unsubscribe(&conn.id, &job_id);
        info!(conn_id = %conn.id, job_id = %job_id, removed, "unsubscribed");
        conn.send_message(&ServerMessage::Unsubscribed { job_id });
    }

    /// Remove a connection. Safe to call more than once; only the first
    /// call for an id does anything.
    pub fn disconnect(&self, id: &ConnectionId, reason: CloseReason) -> bool {
        self.disconnect_with(id, reason, None)
    }

    /// Remove a connection, writing `farewell` as its final frame.
    pub(crate) fn disconnect_with(
        &self,
        id: &ConnectionId,
        reason: CloseReason,
        farewell: Option<&ServerMessage>,
    ) -> bool {
        let Some(conn) = self.registry.release(id) else {
            return false;
        };
        match farewell {
            Some(message) => conn.close_with(message),
            None => conn.close(),
        }
        self.recorder.gauge_inc("connections_active", &[], -1);
        self.recorder
            .counter_inc("connections_closed_total", &[("reason", reason.as_str())], 1);
        if conn.drop_count() > 0 {
            self.recorder
                .counter_inc("send_dropped_total", &[], conn.drop_count());
        }
        info!(
            conn_id = %conn.id,
            origin = %conn.origin,
            reason = reason.as_str(),
            age_ms = u64::try_from(conn.age().as_millis()).unwrap_or(u64::MAX),
            dropped = conn.drop_count(),
            "connection closed"
        );
        true
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        self.registry
            .snapshot(self.config.idle_timeout_ms, self.config.idle_advisory(), Instant::now())
    }

    /// Stop background tasks and close every connection. New connections
    /// are rejected from here on.
    pub fn drain(&self) -> usize {
        self.registry.begin_drain();
        self.tasks.cancel();
        let mut closed = 0;
        for conn in self.registry.connections() {
            if self.disconnect(&conn.id, CloseReason::Drain) {
                closed += 1;
            }
        }
        info!(closed, "gateway drained");
        closed
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<GatewayRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.recorder
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
