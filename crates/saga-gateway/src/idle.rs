//! Idle monitor: evicts connections that stopped proving liveness.

use std::sync::Arc;
use std::time::Duration;

use saga_core::GatewayError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::ClientConnection;
use crate::gateway::{CloseReason, Gateway};
use crate::protocol::ServerMessage;
use crate::registry::GatewayRegistry;

impl GatewayRegistry {
    /// Connections whose last client activity is at least `timeout` old.
    pub fn idle_connections(&self, timeout: Duration, now: Instant) -> Vec<Arc<ClientConnection>> {
        self.tables
            .lock()
            .connections
            .values()
            .filter(|e| e.conn.idle_for(now) >= timeout)
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }
}

impl Gateway {
    /// Evict every connection idle past the configured timeout. Each evicted
    /// client gets one `IDLE_TIMEOUT` error before its socket closes.
    pub fn sweep_idle(&self) -> usize {
        let Some(timeout) = self.config().idle_timeout() else {
            return 0;
        };
        let now = Instant::now();
        let mut evicted = 0;
        for conn in self.registry().idle_connections(timeout, now) {
            let idle_ms = u64::try_from(conn.idle_for(now).as_millis()).unwrap_or(u64::MAX);
            let notice = ServerMessage::error(&GatewayError::IdleEvicted { idle_ms }, None);
            if self.disconnect_with(&conn.id, CloseReason::Idle, Some(&notice)) {
                evicted += 1;
                info!(conn_id = %conn.id, origin = %conn.origin, idle_ms, "evicted idle connection");
            }
        }
        if evicted > 0 {
            self.recorder().counter_inc("idle_evictions_total", &[], evicted as u64);
        }
        evicted
    }
}

/// Run [`Gateway::sweep_idle`] every `interval` until cancelled.
pub(crate) fn spawn_idle_monitor(
    gateway: Gateway,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(interval_ms = interval.as_millis() as u64, "idle monitor started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    gateway.sweep_idle();
                }
            }
        }
        debug!("idle monitor stopped");
    })
}
