//! Bus subscriber: decodes envelopes and fans them out to job subscribers.

use std::sync::Arc;

use saga_core::{EventEnvelope, GatewayError};
use saga_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusRecv, BusSource};
use crate::connection::Delivery;
use crate::protocol::ServerMessage;
use crate::registry::GatewayRegistry;

/// What happened to one bus message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub malformed: bool,
    pub subscribers: usize,
    pub sent: usize,
    pub buffered: usize,
    pub duplicates: usize,
    pub dropped: usize,
    /// Subscribers that unsubscribed after the fan-out list was taken.
    pub unsubscribed: usize,
}

pub struct BusRelay {
    registry: Arc<GatewayRegistry>,
    recorder: Arc<MetricsRecorder>,
}

impl BusRelay {
    pub fn new(registry: Arc<GatewayRegistry>, recorder: Arc<MetricsRecorder>) -> Self {
        Self { registry, recorder }
    }

    /// Spawn the relay loop. Runs until the source closes or `cancel` fires.
    pub fn spawn<S>(self, mut source: S, cancel: CancellationToken) -> JoinHandle<()>
    where
        S: BusSource + 'static,
    {
        tokio::spawn(async move {
            info!("bus relay started");
            loop {
                let recv = tokio::select! {
                    () = cancel.cancelled() => break,
                    recv = source.recv() => recv,
                };
                match recv {
                    BusRecv::Message(raw) => {
                        self.handle(&raw);
                    }
                    BusRecv::Lagged(skipped) => {
                        self.recorder.counter_inc("bus_lagged_total", &[], skipped);
                        warn!(skipped, "bus relay lagged, messages skipped");
                    }
                    BusRecv::Closed => {
                        info!("bus channel closed");
                        break;
                    }
                }
            }
            info!("bus relay stopped");
        })
    }

    /// Decode one raw payload and hand it to every subscriber of its job.
    ///
    /// Each send is a non-blocking enqueue, so a stalled socket only loses
    /// its own copy.
    pub fn handle(&self, raw: &str) -> RelayOutcome {
        self.recorder.counter_inc("bus_messages_total", &[], 1);
        let envelope = match EventEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = GatewayError::MalformedBusMessage(e.to_string());
                self.recorder.counter_inc("bus_messages_malformed_total", &[], 1);
                warn!(error = %err, error_kind = err.error_kind(), bytes = raw.len(), "dropping bus message");
                return RelayOutcome {
                    malformed: true,
                    ..RelayOutcome::default()
                };
            }
        };

        let subscribers = self.registry.subscribers_of(&envelope.job_id);
        let mut outcome = RelayOutcome {
            subscribers: subscribers.len(),
            ..RelayOutcome::default()
        };
        if subscribers.is_empty() {
            return outcome;
        }

        let frame = match ServerMessage::from_envelope(&envelope, false).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(job_id = %envelope.job_id, error = %e, "failed to serialize live event");
                return outcome;
            }
        };
        for conn in &subscribers {
            match conn.deliver_live(&envelope.job_id, envelope.sequence, Arc::clone(&frame)) {
                Delivery::Sent => outcome.sent += 1,
                Delivery::Buffered => outcome.buffered += 1,
                Delivery::Duplicate => outcome.duplicates += 1,
                Delivery::Dropped => {
                    outcome.dropped += 1;
                    debug!(conn_id = %conn.id, job_id = %envelope.job_id, "subscriber queue full, event dropped");
                }
                Delivery::NotSubscribed => outcome.unsubscribed += 1,
            }
        }

        let kind = envelope.kind();
        self.recorder.counter_inc(
            "bus_deliveries_total",
            &[("kind", kind.as_str())],
            (outcome.sent + outcome.buffered) as u64,
        );
        if outcome.dropped > 0 {
            self.recorder
                .counter_inc("bus_deliveries_dropped_total", &[], outcome.dropped as u64);
        }
        debug!(
            job_id = %envelope.job_id,
            kind = kind.as_str(),
            subscribers = outcome.subscribers,
            sent = outcome.sent,
            buffered = outcome.buffered,
            "relayed bus event"
        );
        outcome
    }
}
