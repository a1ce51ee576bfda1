//! The gateway's connection and subscription tables.
//!
//! Every table lives behind one mutex so that admission, subscription,
//! eviction and metrics reads all observe a single consistent state. The
//! operations themselves are split by concern across `admission`,
//! `subscriptions` and `metrics`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use saga_core::{CatchUpRecord, ConnectionId, JobId};

use crate::connection::ClientConnection;

/// Cap on retained catch-up records; the oldest is evicted past it.
pub(crate) const MAX_CATCH_UP_RECORDS: usize = 10_000;

/// Static limits the registry enforces. `0` disables a limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Limits {
    pub max_connections: usize,
    pub max_connections_per_origin: usize,
    pub max_subscriptions_per_client: usize,
}

pub(crate) struct Entry {
    pub(crate) conn: Arc<ClientConnection>,
    pub(crate) jobs: HashSet<JobId>,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) connections: HashMap<ConnectionId, Entry>,
    pub(crate) per_origin: HashMap<String, usize>,
    pub(crate) jobs: HashMap<JobId, HashSet<ConnectionId>>,
    pub(crate) last_catch_up: HashMap<JobId, CatchUpRecord>,
}

/// Owner of all live connection and subscription state for one process.
pub struct GatewayRegistry {
    pub(crate) limits: Limits,
    pub(crate) tables: Mutex<Tables>,
    pub(crate) draining: AtomicBool,
}

impl GatewayRegistry {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            tables: Mutex::new(Tables::default()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn connection_count(&self) -> usize {
        self.tables.lock().connections.len()
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.tables.lock().connections.get(id).map(|e| Arc::clone(&e.conn))
    }

    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.tables
            .lock()
            .connections
            .values()
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }

    /// Stop admitting new connections.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Overwrite the latest catch-up outcome for the record's job.
    pub fn record_catch_up(&self, record: CatchUpRecord) {
        let mut tables = self.tables.lock();
        tables.last_catch_up.insert(record.job_id.clone(), record);
        if tables.last_catch_up.len() > MAX_CATCH_UP_RECORDS {
            let oldest = tables
                .last_catch_up
                .values()
                .min_by_key(|r| r.recorded_at)
                .map(|r| r.job_id.clone());
            if let Some(job_id) = oldest {
                tables.last_catch_up.remove(&job_id);
            }
        }
    }

    pub fn last_catch_up(&self, job_id: &JobId) -> Option<CatchUpRecord> {
        self.tables.lock().last_catch_up.get(job_id).cloned()
    }

    /// Check that the two directions of the subscription index agree.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let tables = self.tables.lock();
        for (conn_id, entry) in &tables.connections {
            for job in &entry.jobs {
                assert!(
                    tables.jobs.get(job).is_some_and(|s| s.contains(conn_id)),
                    "{conn_id} holds {job} but is not in its subscriber set"
                );
            }
        }
        for (job, subscribers) in &tables.jobs {
            assert!(!subscribers.is_empty(), "empty subscriber set kept for {job}");
            for conn_id in subscribers {
                assert!(
                    tables.connections.get(conn_id).is_some_and(|e| e.jobs.contains(job)),
                    "{job} lists {conn_id} which does not hold it"
                );
            }
        }
        let origin_total: usize = tables.per_origin.values().sum();
        assert_eq!(origin_total, tables.connections.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use saga_core::ReplaySource;

    fn record(job: &str, offset_secs: i64) -> CatchUpRecord {
        CatchUpRecord {
            job_id: JobId::parse(job).unwrap(),
            replayed_events: 1,
            replay_source: ReplaySource::Aggregate,
            replay_duration_ms: 0,
            recorded_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn catch_up_record_is_overwritten() {
        let registry = GatewayRegistry::new(Limits::default());
        registry.record_catch_up(record("job-1", 0));
        let mut newer = record("job-1", 1);
        newer.replayed_events = 9;
        registry.record_catch_up(newer);
        assert_eq!(registry.last_catch_up(&JobId::parse("job-1").unwrap()).unwrap().replayed_events, 9);
    }

    #[test]
    fn catch_up_records_are_capped() {
        let registry = GatewayRegistry::new(Limits::default());
        for i in 0..=MAX_CATCH_UP_RECORDS {
            registry.record_catch_up(record(&format!("job-{i}"), i as i64));
        }
        let tables = registry.tables.lock();
        assert_eq!(tables.last_catch_up.len(), MAX_CATCH_UP_RECORDS);
        assert!(!tables.last_catch_up.contains_key(&JobId::parse("job-0").unwrap()));
    }

    #[test]
    fn drain_flag() {
        let registry = GatewayRegistry::new(Limits::default());
        assert!(!registry.is_draining());
        registry.begin_drain();
        assert!(registry.is_draining());
    }
}
