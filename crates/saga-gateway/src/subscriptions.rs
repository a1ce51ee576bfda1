//! Subscription table: connection → jobs and job → connections.

use std::collections::HashSet;
use std::sync::Arc;

use saga_core::{ConnectionId, GatewayError, JobId};

use crate::connection::ClientConnection;
use crate::registry::GatewayRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// New subscription; a catch-up is now pending for it.
    Added,
    AlreadySubscribed,
}

impl GatewayRegistry {
    /// Link a connection to a job.
    ///
    /// On `Added` the connection is already buffering live frames for the
    /// job, so nothing published from here on can slip past the catch-up.
    pub fn subscribe(
        &self,
        conn_id: &ConnectionId,
        job_id: &JobId,
    ) -> Result<SubscribeOutcome, GatewayError> {
        let limit = self.limits.max_subscriptions_per_client;
        let mut tables = self.tables.lock();
        let entry = tables
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| GatewayError::UnknownConnection(conn_id.clone()))?;

        if entry.jobs.contains(job_id) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }
        if limit > 0 && entry.jobs.len() >= limit {
            return Err(GatewayError::SubscriptionLimit { limit });
        }

        entry.jobs.insert(job_id.clone());
        entry.conn.begin_replay(job_id);
        tables
            .jobs
            .entry(job_id.clone())
            .or_insert_with(HashSet::new)
            .insert(conn_id.clone());
        Ok(SubscribeOutcome::Added)
    }

    /// Remove a subscription. Unknown pairs are a successful no-op.
    pub fn unsubscribe(&self, conn_id: &ConnectionId, job_id: &JobId) -> bool {
        let mut tables = self.tables.lock();
        let removed = match tables.connections.get_mut(conn_id) {
            Some(entry) => {
                let removed = entry.jobs.remove(job_id);
                if removed {
                    entry.conn.forget_job(job_id);
                }
                removed
            }
            None => false,
        };
        if removed {
            if let Some(subscribers) = tables.jobs.get_mut(job_id) {
                subscribers.remove(conn_id);
                if subscribers.is_empty() {
                    tables.jobs.remove(job_id);
                }
            }
        }
        removed
    }

    /// Current subscribers of a job. Empty for jobs nobody watches.
    pub fn subscribers_of(&self, job_id: &JobId) -> Vec<Arc<ClientConnection>> {
        let tables = self.tables.lock();
        let Some(ids) = tables.jobs.get(job_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| tables.connections.get(id))
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }

    pub fn subscriptions_of(&self, conn_id: &ConnectionId) -> Vec<JobId> {
        let tables = self.tables.lock();
        let mut jobs: Vec<JobId> = tables
            .connections
            .get(conn_id)
            .map(|e| e.jobs.iter().cloned().collect())
            .unwrap_or_default();
        jobs.sort();
        jobs
    }
}
