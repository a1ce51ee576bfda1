//! Catch-up replay of persisted history to a new subscriber.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use saga_core::{
    CatchUpRecord, EventLog, EventRecord, GatewayError, HistoryError, JobAggregateStore, JobId,
    JobSnapshot, ListOptions, ReplaySource,
};
use saga_telemetry::MetricsRecorder;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::connection::ClientConnection;
use crate::protocol::ServerMessage;

enum History {
    Events(Vec<EventRecord>),
    Snapshot(JobSnapshot),
    Empty,
}

/// Streams a job's history to one connection before live delivery resumes.
pub struct CatchUpReplayer {
    event_log: Arc<dyn EventLog>,
    job_store: Arc<dyn JobAggregateStore>,
    limit: Option<u32>,
    warn_threshold: Duration,
    recorder: Arc<MetricsRecorder>,
}

impl CatchUpReplayer {
    pub fn new(
        event_log: Arc<dyn EventLog>,
        job_store: Arc<dyn JobAggregateStore>,
        limit: Option<u32>,
        warn_threshold: Duration,
        recorder: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            event_log,
            job_store,
            limit,
            warn_threshold,
            recorder,
        }
    }

    /// Replay history for `job_id` to `conn`, then release any live frames
    /// buffered meanwhile. Read failures degrade to [`ReplaySource::None`].
    #[instrument(skip_all, fields(conn_id = %conn.id, job_id = %job_id))]
    pub async fn replay(&self, job_id: &JobId, conn: &ClientConnection) -> CatchUpRecord {
        let started = Instant::now();

        let (source, replayed, watermark) = match self.load(job_id).await {
            Ok(History::Events(mut records)) => {
                records.sort_by(|a, b| {
                    a.occurred_at
                        .cmp(&b.occurred_at)
                        .then(a.sequence.cmp(&b.sequence))
                });
                let watermark = records.iter().map(|r| r.sequence).max();
                let mut written = 0;
                for record in &records {
                    let message = ServerMessage::from_envelope(&record.to_envelope(), true);
                    if !self.write(conn, job_id, &message).await {
                        break;
                    }
                    written += 1;
                }
                (ReplaySource::Events, written, watermark)
            }
            Ok(History::Snapshot(snapshot)) => {
                let message = ServerMessage::from_envelope(&snapshot.to_status_envelope(), true);
                let written = usize::from(self.write(conn, job_id, &message).await);
                (ReplaySource::Aggregate, written, None)
            }
            Ok(History::Empty) => (ReplaySource::None, 0, None),
            Err(e) => {
                let err = GatewayError::ReplayDegraded(e.to_string());
                warn!(error = %err, error_kind = err.error_kind(), "history read failed, replaying nothing");
                self.recorder.counter_inc("replay_degraded_total", &[], 1);
                (ReplaySource::None, 0, None)
            }
        };

        let flushed = conn.finish_replay(job_id, watermark).await;
        let elapsed = started.elapsed();
        let record = CatchUpRecord {
            job_id: job_id.clone(),
            replayed_events: replayed,
            replay_source: source,
            replay_duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            recorded_at: Utc::now(),
        };

        self.recorder
            .counter_inc("replays_total", &[("source", source.as_str())], 1);
        self.recorder
            .histogram_observe("replay_duration_ms", &[], elapsed.as_secs_f64() * 1000.0);
        if elapsed > self.warn_threshold {
            self.recorder.counter_inc("replay_slow_total", &[], 1);
            warn!(
                replay_source = source.as_str(),
                replayed,
                duration_ms = record.replay_duration_ms,
                threshold_ms = u64::try_from(self.warn_threshold.as_millis()).unwrap_or(u64::MAX),
                "catch-up replay exceeded threshold"
            );
        } else {
            info!(
                replay_source = source.as_str(),
                replayed,
                flushed,
                duration_ms = record.replay_duration_ms,
                "catch-up replay complete"
            );
        }
        record
    }

    async fn load(&self, job_id: &JobId) -> Result<History, HistoryError> {
        let options = ListOptions {
            limit: self.limit,
            before: None,
        };
        let records = self.event_log.list(job_id, options).await?;
        if !records.is_empty() {
            return Ok(History::Events(records));
        }
        Ok(match self.job_store.find(job_id).await? {
            Some(snapshot) => History::Snapshot(snapshot),
            None => History::Empty,
        })
    }

    /// Write one replayed frame, stopping once the client is gone or has
    /// unsubscribed from the job.
    async fn write(&self, conn: &ClientConnection, job_id: &JobId, message: &ServerMessage) -> bool {
        if conn.is_closed() || !conn.is_replaying(job_id) {
            debug!("subscriber gone, stopping replay");
            return false;
        }
        match message.to_frame() {
            Ok(frame) => conn.send_wait(frame).await,
            Err(e) => {
                warn!(error = %e, "failed to serialize replayed event");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use parking_lot::Mutex;
    use saga_core::{ConnectionId, EnvelopePayload, EventId, StreamEvent};
    use serde_json::{json, Value};

    use crate::connection::OutboundRx;

    /// In-memory history used by gateway unit tests.
    #[derive(Default)]
    pub(crate) struct MemoryHistory {
        pub events: Mutex<HashMap<JobId, Vec<EventRecord>>>,
        pub snapshots: Mutex<HashMap<JobId, JobSnapshot>>,
        pub fail: Mutex<bool>,
    }

    impl MemoryHistory {
        pub fn seed(&self, job_id: &JobId, count: usize) {
            let base: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().unwrap();
            let mut events = self.events.lock();
            let list = events.entry(job_id.clone()).or_default();
            for i in 0..count {
                list.push(EventRecord {
                    id: EventId::new(),
                    job_id: job_id.clone(),
                    sequence: i as u64 + 1,
                    occurred_at: base + ChronoDuration::seconds(i as i64),
                    payload: EnvelopePayload::Generation {
                        event: StreamEvent::new("token.batch", base + ChronoDuration::seconds(i as i64))
                            .with("n", json!(i)),
                    },
                });
            }
        }
    }

    #[async_trait]
    impl EventLog for MemoryHistory {
        async fn list(&self, job_id: &JobId, options: ListOptions) -> Result<Vec<EventRecord>, HistoryError> {
            if *self.fail.lock() {
                return Err(HistoryError::Unavailable("event log offline".into()));
            }
            let mut records = self.events.lock().get(job_id).cloned().unwrap_or_default();
            if let Some(limit) = options.limit {
                let skip = records.len().saturating_sub(limit as usize);
                records = records.split_off(skip);
            }
            Ok(records)
        }
    }

    #[async_trait]
    impl JobAggregateStore for MemoryHistory {
        async fn find(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, HistoryError> {
            Ok(self.snapshots.lock().get(job_id).cloned())
        }
    }

    fn replayer(history: &Arc<MemoryHistory>, limit: Option<u32>) -> (CatchUpReplayer, Arc<MetricsRecorder>) {
        let recorder = Arc::new(MetricsRecorder::new());
        let replayer = CatchUpReplayer::new(
            history.clone(),
            history.clone(),
            limit,
            Duration::from_secs(2),
            Arc::clone(&recorder),
        );
        (replayer, recorder)
    }

    fn connection(capacity: usize) -> (ClientConnection, OutboundRx) {
        ClientConnection::open(ConnectionId::new(), "o", capacity)
    }

    fn frames(rx: &mut OutboundRx) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(serde_json::from_str(&f).unwrap());
        }
        out
    }

    fn job() -> JobId {
        JobId::parse("job-42").unwrap()
    }

    #[tokio::test]
    async fn replays_events_in_order() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 50);
        let (replayer, recorder) = replayer(&history, None);
        let (conn, mut rx) = connection(128);
        conn.begin_replay(&job());

        let record = replayer.replay(&job(), &conn).await;
        assert_eq!(record.replay_source, ReplaySource::Events);
        assert_eq!(record.replayed_events, 50);

        let got = frames(&mut rx);
        assert_eq!(got.len(), 50);
        for (i, frame) in got.iter().enumerate() {
            assert_eq!(frame["type"], "generation-event");
            assert_eq!(frame["replay"], true);
            assert_eq!(frame["event"]["n"], i);
        }
        assert_eq!(recorder.counter_get("replays_total", &[("source", "events")]), 1);
        assert!(!conn.is_replaying(&job()));
    }

    #[tokio::test]
    async fn out_of_order_history_is_sorted() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 5);
        history.events.lock().get_mut(&job()).unwrap().reverse();
        let (replayer, _) = replayer(&history, None);
        let (conn, mut rx) = connection(16);
        conn.begin_replay(&job());
        let _ = replayer.replay(&job(), &conn).await;
        let seqs: Vec<u64> = frames(&mut rx).iter().map(|f| f["sequence"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn limit_keeps_most_recent() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 10);
        let (replayer, _) = replayer(&history, Some(3));
        let (conn, mut rx) = connection(16);
        conn.begin_replay(&job());
        let record = replayer.replay(&job(), &conn).await;
        assert_eq!(record.replayed_events, 3);
        let seqs: Vec<u64> = frames(&mut rx).iter().map(|f| f["sequence"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn falls_back_to_aggregate() {
        let history = Arc::new(MemoryHistory::default());
        history.snapshots.lock().insert(
            job(),
            JobSnapshot {
                job_id: job(),
                status: "running".into(),
                progress: Some(0.5),
                detail: None,
                updated_at: Utc::now(),
            },
        );
        let (replayer, _) = replayer(&history, None);
        let (conn, mut rx) = connection(4);
        conn.begin_replay(&job());

        let record = replayer.replay(&job(), &conn).await;
        assert_eq!(record.replay_source, ReplaySource::Aggregate);
        assert_eq!(record.replayed_events, 1);
        let got = frames(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "job-status");
        assert_eq!(got[0]["status"], "running");
        assert_eq!(got[0]["snapshot"]["progress"], 0.5);
    }

    #[tokio::test]
    async fn unknown_job_replays_nothing() {
        let history = Arc::new(MemoryHistory::default());
        let (replayer, _) = replayer(&history, None);
        let (conn, mut rx) = connection(4);
        conn.begin_replay(&job());
        let record = replayer.replay(&job(), &conn).await;
        assert_eq!(record.replay_source, ReplaySource::None);
        assert_eq!(record.replayed_events, 0);
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn read_failure_degrades_to_none() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 3);
        *history.fail.lock() = true;
        let (replayer, recorder) = replayer(&history, None);
        let (conn, mut rx) = connection(4);
        conn.begin_replay(&job());

        let record = replayer.replay(&job(), &conn).await;
        assert_eq!(record.replay_source, ReplaySource::None);
        assert_eq!(record.replayed_events, 0);
        assert!(frames(&mut rx).is_empty());
        assert_eq!(recorder.counter_get("replay_degraded_total", &[]), 1);
        assert!(!conn.is_replaying(&job()));
    }

    #[tokio::test]
    async fn closed_connection_stops_writes() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 10);
        let (replayer, _) = replayer(&history, None);
        let (conn, mut rx) = connection(16);
        conn.begin_replay(&job());
        conn.close();
        let record = replayer.replay(&job(), &conn).await;
        assert_eq!(record.replayed_events, 0);
        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn live_frames_follow_history() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 3);
        let (replayer, _) = replayer(&history, None);
        let (conn, mut rx) = connection(16);
        conn.begin_replay(&job());
        conn.deliver_live(&job(), Some(3), Arc::new(r#"{"live":3}"#.into()));
        conn.deliver_live(&job(), Some(4), Arc::new(r#"{"live":4}"#.into()));

        let _ = replayer.replay(&job(), &conn).await;
        let got = frames(&mut rx);
        assert_eq!(got.len(), 4);
        assert_eq!(got[2]["sequence"], 3);
        assert_eq!(got[3], json!({"live": 4}));
    }

    #[tokio::test]
    async fn live_frames_buffered_behind_a_full_queue_are_not_lost() {
        let history = Arc::new(MemoryHistory::default());
        history.seed(&job(), 4);
        let (replayer, _) = replayer(&history, None);
        let (conn, mut rx) = connection(4);
        let conn = Arc::new(conn);
        conn.begin_replay(&job());
        conn.deliver_live(&job(), Some(5), Arc::new(r#"{"live":5}"#.into()));
        conn.deliver_live(&job(), Some(6), Arc::new(r#"{"live":6}"#.into()));

        let task = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { replayer.replay(&job(), &conn).await })
        };
        let mut got = Vec::new();
        while got.len() < 6 {
            got.push(serde_json::from_str::<Value>(&rx.recv().await.unwrap()).unwrap());
        }
        let record = task.await.unwrap();

        assert_eq!(record.replayed_events, 4);
        assert_eq!(conn.drop_count(), 0);
        assert_eq!(got[3]["sequence"], 4);
        assert_eq!(got[4], json!({"live": 5}));
        assert_eq!(got[5], json!({"live": 6}));
        assert!(rx.try_recv().is_err());
    }
}
