//! Per-socket connection state.
//!
//! Outbound frames share one ordered queue. Event frames (replayed or live)
//! and control replies (acks, pongs, errors) draw from separate slot pools,
//! so a queue saturated by events never swallows a reply. The farewell
//! frame written on eviction takes no slot at all.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use saga_core::{ConnectionId, JobId};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::ServerMessage;

/// Control replies a connection may have queued at once.
pub const CONTROL_QUEUE_CAPACITY: usize = 32;

/// One queued outbound frame. Its slot is released when the writer drops it.
pub struct OutboundFrame {
    frame: Arc<String>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl OutboundFrame {
    pub fn as_str(&self) -> &str {
        &self.frame
    }
}

impl Deref for OutboundFrame {
    type Target = str;

    fn deref(&self) -> &str {
        &self.frame
    }
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OutboundFrame").field(&self.frame).finish()
    }
}

/// Receiving end of a connection's outbound queue, owned by the socket writer.
pub type OutboundRx = mpsc::UnboundedReceiver<OutboundFrame>;

/// Live-delivery state of one (connection, job) pair.
#[derive(Debug)]
enum DeliveryCursor {
    /// Catch-up in flight: live frames wait here, tagged with their sequence.
    Replaying {
        pending: Vec<(Option<u64>, Arc<String>)>,
    },
    /// Catch-up done. Frames at or below `watermark` were already replayed.
    Live { watermark: Option<u64> },
}

/// Outcome of handing a live frame to a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Buffered,
    /// Already covered by replayed history.
    Duplicate,
    /// Queue full or socket gone.
    Dropped,
    /// The connection is not (or no longer) subscribed to the job.
    NotSubscribed,
}

/// A connected websocket client.
pub struct ClientConnection {
    pub id: ConnectionId,
    pub origin: String,
    pub connected_at: Instant,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    event_slots: Arc<Semaphore>,
    control_slots: Arc<Semaphore>,
    last_activity: Mutex<Instant>,
    cursors: Mutex<HashMap<JobId, DeliveryCursor>>,
    pending_limit: usize,
    closed: CancellationToken,
    dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a connection whose queue holds up to `queue_capacity` event
    /// frames, plus the receiver its socket writer drains.
    pub fn open(id: ConnectionId, origin: impl Into<String>, queue_capacity: usize) -> (Self, OutboundRx) {
        let capacity = queue_capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let conn = Self {
            id,
            origin: origin.into(),
            connected_at: now,
            tx,
            event_slots: Arc::new(Semaphore::new(capacity)),
            control_slots: Arc::new(Semaphore::new(CONTROL_QUEUE_CAPACITY)),
            last_activity: Mutex::new(now),
            cursors: Mutex::new(HashMap::new()),
            pending_limit: capacity,
            closed: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
        };
        (conn, rx)
    }

    /// Queue an event frame without waiting. Returns `false` and counts a
    /// drop when the queue is full or the socket is closing.
    pub fn send(&self, frame: Arc<String>) -> bool {
        let queued = match Arc::clone(&self.event_slots).try_acquire_owned() {
            Ok(slot) => self.enqueue(frame, Some(slot)),
            Err(_) => false,
        };
        if !queued {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }

    /// Queue a control reply. Replies have their own slots, so they get
    /// through even while event frames fill the queue.
    pub fn send_message(&self, message: &ServerMessage) -> bool {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "failed to serialize outbound message");
                return false;
            }
        };
        let queued = match Arc::clone(&self.control_slots).try_acquire_owned() {
            Ok(slot) => self.enqueue(frame, Some(slot)),
            Err(_) => false,
        };
        if !queued {
            self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id = %self.id, message_type = message.message_type(), "control reply dropped");
        }
        queued
    }

    /// Queue an event frame, waiting for room. Gives up once the connection
    /// closes.
    pub async fn send_wait(&self, frame: Arc<String>) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        let slot = tokio::select! {
            biased;
            () = self.closed.cancelled() => return false,
            slot = Arc::clone(&self.event_slots).acquire_owned() => slot,
        };
        match slot {
            Ok(slot) => self.enqueue(frame, Some(slot)),
            Err(_) => false,
        }
    }

    /// Queue `message` as the last frame and close the connection. The
    /// farewell needs no slot, so a full queue cannot lose it.
    pub fn close_with(&self, message: &ServerMessage) {
        match message.to_frame() {
            Ok(frame) => {
                self.enqueue(frame, None);
            }
            Err(e) => warn!(conn_id = %self.id, error = %e, "failed to serialize farewell"),
        }
        self.close();
    }

    fn enqueue(&self, frame: Arc<String>, slot: Option<OwnedSemaphorePermit>) -> bool {
        !self.closed.is_cancelled() && self.tx.send(OutboundFrame { frame, _slot: slot }).is_ok()
    }

    /// Hand a live bus frame to this connection, honouring any catch-up in
    /// flight for the job.
    pub fn deliver_live(&self, job_id: &JobId, sequence: Option<u64>, frame: Arc<String>) -> Delivery {
        let mut cursors = self.cursors.lock();
        match cursors.get_mut(job_id) {
            Some(DeliveryCursor::Replaying { pending }) => {
                if pending.len() >= self.pending_limit {
                    self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    return Delivery::Dropped;
                }
                pending.push((sequence, frame));
                Delivery::Buffered
            }
            Some(DeliveryCursor::Live { watermark }) => {
                if covered(sequence, *watermark) {
                    Delivery::Duplicate
                } else if self.send(frame) {
                    Delivery::Sent
                } else {
                    Delivery::Dropped
                }
            }
            None => Delivery::NotSubscribed,
        }
    }

    /// Start buffering live frames for `job_id`.
    pub(crate) fn begin_replay(&self, job_id: &JobId) {
        self.cursors
            .lock()
            .insert(job_id.clone(), DeliveryCursor::Replaying { pending: Vec::new() });
    }

    /// Flush live frames buffered during catch-up, waiting for queue room,
    /// and switch the job to direct delivery once nothing is left pending.
    /// Frames at or below `watermark` were replayed and are skipped. Stops
    /// early if the job is unsubscribed or the connection closes.
    pub(crate) async fn finish_replay(&self, job_id: &JobId, watermark: Option<u64>) -> usize {
        let mut flushed = 0;
        while let Some(batch) = self.take_pending(job_id, watermark) {
            for (sequence, frame) in batch {
                if covered(sequence, watermark) {
                    continue;
                }
                if !self.is_replaying(job_id) || !self.send_wait(frame).await {
                    return flushed;
                }
                flushed += 1;
            }
        }
        flushed
    }

    /// Take whatever is buffered for `job_id`. When nothing is, the cursor
    /// goes live under the same lock, so no frame can slip in between.
    fn take_pending(&self, job_id: &JobId, watermark: Option<u64>) -> Option<Vec<(Option<u64>, Arc<String>)>> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.get_mut(job_id)?;
        let DeliveryCursor::Replaying { pending } = cursor else {
            return None;
        };
        if pending.is_empty() {
            *cursor = DeliveryCursor::Live { watermark };
            return None;
        }
        Some(std::mem::take(pending))
    }

    pub(crate) fn is_replaying(&self, job_id: &JobId) -> bool {
        matches!(self.cursors.lock().get(job_id), Some(DeliveryCursor::Replaying { .. }))
    }

    pub(crate) fn forget_job(&self, job_id: &JobId) {
        self.cursors.lock().remove(job_id);
    }

    /// Record client-initiated activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    /// Signal the socket tasks to flush and close.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn covered(sequence: Option<u64>, watermark: Option<u64>) -> bool {
    matches!((sequence, watermark), (Some(s), Some(w)) if s <= w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (ClientConnection, OutboundRx) {
        ClientConnection::open(ConnectionId::new(), "https://a.example", capacity)
    }

    fn job() -> JobId {
        JobId::parse("job-1").unwrap()
    }

    fn frame(s: &str) -> Arc<String> {
        Arc::new(s.to_string())
    }

    fn drain(rx: &mut OutboundRx) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f.as_str().to_owned());
        }
        out
    }

    #[tokio::test]
    async fn send_to_full_channel_counts_drop() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(frame("a")));
        assert!(!conn.send(frame("b")));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn received_frame_frees_its_slot() {
        let (conn, mut rx) = make_connection(1);
        assert!(conn.send(frame("a")));
        drop(rx.try_recv().unwrap());
        assert!(conn.send(frame("b")));
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let (conn, mut rx) = make_connection(0);
        assert!(conn.send(frame("a")));
        assert!(!conn.send(frame("b")));
        assert_eq!(drain(&mut rx), vec!["a"]);
    }

    #[tokio::test]
    async fn control_replies_bypass_full_event_queue() {
        let (conn, mut rx) = make_connection(1);
        assert!(conn.send(frame("event")));
        assert!(!conn.send(frame("overflow")));
        assert!(conn.send_message(&ServerMessage::Pong));
        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert!(got[1].contains("pong"));
    }

    #[tokio::test]
    async fn farewell_is_queued_last_even_when_full() {
        let (conn, mut rx) = make_connection(1);
        assert!(conn.send(frame("event")));
        conn.close_with(&ServerMessage::Pong);
        assert!(conn.is_closed());
        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert!(got[1].contains("pong"));

        // Nothing follows the farewell.
        conn.close_with(&ServerMessage::Pong);
        assert!(!conn.send_message(&ServerMessage::Pong));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn send_after_close_is_dropped() {
        let (conn, mut rx) = make_connection(4);
        conn.close();
        assert!(!conn.send(frame("late")));
        assert!(!conn.send_wait(frame("late")).await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn live_frames_without_cursor_are_not_delivered() {
        let (conn, mut rx) = make_connection(4);
        assert_eq!(conn.deliver_live(&job(), Some(1), frame("x")), Delivery::NotSubscribed);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(conn.drop_count(), 0);
    }

    #[tokio::test]
    async fn forgotten_job_stops_live_delivery() {
        let (conn, mut rx) = make_connection(4);
        conn.begin_replay(&job());
        assert_eq!(conn.finish_replay(&job(), None).await, 0);
        assert_eq!(conn.deliver_live(&job(), Some(1), frame("before")), Delivery::Sent);
        conn.forget_job(&job());
        assert_eq!(conn.deliver_live(&job(), Some(2), frame("after")), Delivery::NotSubscribed);
        assert_eq!(drain(&mut rx), vec!["before"]);
    }

    #[tokio::test]
    async fn replay_buffers_then_flushes_in_order() {
        let (conn, mut rx) = make_connection(16);
        conn.begin_replay(&job());
        assert!(conn.is_replaying(&job()));
        assert_eq!(conn.deliver_live(&job(), Some(4), frame("live-4")), Delivery::Buffered);
        assert_eq!(conn.deliver_live(&job(), Some(5), frame("live-5")), Delivery::Buffered);
        assert!(conn.send_wait(frame("hist-1")).await);
        assert!(conn.send_wait(frame("hist-2")).await);

        let flushed = conn.finish_replay(&job(), Some(2)).await;
        assert_eq!(flushed, 2);
        assert_eq!(drain(&mut rx), vec!["hist-1", "hist-2", "live-4", "live-5"]);
        assert!(!conn.is_replaying(&job()));
    }

    #[tokio::test]
    async fn flush_waits_for_room_instead_of_dropping() {
        let (conn, mut rx) = make_connection(4);
        let conn = Arc::new(conn);
        conn.begin_replay(&job());
        for i in 1..=4 {
            assert!(conn.send_wait(frame(&format!("hist-{i}"))).await);
        }
        assert_eq!(conn.deliver_live(&job(), Some(5), frame("live-5")), Delivery::Buffered);
        assert_eq!(conn.deliver_live(&job(), Some(6), frame("live-6")), Delivery::Buffered);

        let flush = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.finish_replay(&job(), Some(4)).await })
        };
        let mut got = Vec::new();
        while got.len() < 6 {
            got.push(rx.recv().await.unwrap().as_str().to_owned());
        }
        assert_eq!(flush.await.unwrap(), 2);
        assert_eq!(got, vec!["hist-1", "hist-2", "hist-3", "hist-4", "live-5", "live-6"]);
        assert_eq!(conn.drop_count(), 0);
        assert!(!conn.is_replaying(&job()));
    }

    #[tokio::test]
    async fn frames_buffered_during_flush_are_flushed_too() {
        let (conn, mut rx) = make_connection(1);
        let conn = Arc::new(conn);
        conn.begin_replay(&job());
        assert!(conn.send_wait(frame("hist-1")).await);
        assert_eq!(conn.deliver_live(&job(), Some(2), frame("live-2")), Delivery::Buffered);

        let flush = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.finish_replay(&job(), Some(1)).await })
        };
        tokio::task::yield_now().await;
        // The flush is blocked on a full queue, so this lands in the buffer.
        assert_eq!(conn.deliver_live(&job(), Some(3), frame("live-3")), Delivery::Buffered);

        let mut got = Vec::new();
        while got.len() < 3 {
            got.push(rx.recv().await.unwrap().as_str().to_owned());
        }
        assert_eq!(flush.await.unwrap(), 2);
        assert_eq!(got, vec!["hist-1", "live-2", "live-3"]);
        assert_eq!(conn.deliver_live(&job(), Some(4), frame("live-4")), Delivery::Sent);
    }

    #[tokio::test]
    async fn flush_skips_frames_covered_by_history() {
        let (conn, mut rx) = make_connection(16);
        conn.begin_replay(&job());
        conn.deliver_live(&job(), Some(3), frame("dup-3"));
        conn.deliver_live(&job(), None, frame("unsequenced"));
        conn.deliver_live(&job(), Some(4), frame("live-4"));
        assert_eq!(conn.finish_replay(&job(), Some(3)).await, 2);
        assert_eq!(drain(&mut rx), vec!["unsequenced", "live-4"]);

        // Late duplicates after the flush are also filtered.
        assert_eq!(conn.deliver_live(&job(), Some(2), frame("old")), Delivery::Duplicate);
        assert_eq!(conn.deliver_live(&job(), Some(5), frame("new")), Delivery::Sent);
    }

    #[tokio::test]
    async fn finish_after_forget_is_noop() {
        let (conn, mut rx) = make_connection(16);
        conn.begin_replay(&job());
        conn.deliver_live(&job(), Some(1), frame("live"));
        conn.forget_job(&job());
        assert_eq!(conn.finish_replay(&job(), None).await, 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn pending_buffer_is_bounded() {
        let (conn, _rx) = make_connection(2);
        conn.begin_replay(&job());
        assert_eq!(conn.deliver_live(&job(), None, frame("a")), Delivery::Buffered);
        assert_eq!(conn.deliver_live(&job(), None, frame("b")), Delivery::Buffered);
        assert_eq!(conn.deliver_live(&job(), None, frame("c")), Delivery::Dropped);
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let (conn, _rx) = make_connection(4);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(conn.idle_for(Instant::now()), Duration::from_secs(5));
        conn.touch();
        assert_eq!(conn.idle_for(Instant::now()), Duration::ZERO);
    }

    #[tokio::test]
    async fn send_wait_stops_when_closed() {
        let (conn, _rx) = make_connection(1);
        let conn = Arc::new(conn);
        assert!(conn.send(frame("fill")));
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.send_wait(frame("blocked")).await })
        };
        tokio::task::yield_now().await;
        conn.close();
        assert!(!waiter.await.unwrap());
    }
}
