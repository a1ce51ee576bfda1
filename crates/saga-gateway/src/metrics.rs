//! Read-only gateway snapshot served on `/metrics`.

use std::collections::BTreeMap;
use std::time::Duration;

use saga_core::{CatchUpRecord, JobId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::registry::GatewayRegistry;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySnapshot {
    pub total_connections: usize,
    pub total_subscriptions: usize,
    pub connections_per_origin: BTreeMap<String, usize>,
    pub subscribers_per_job: BTreeMap<JobId, usize>,
    pub idle_clients: usize,
    pub max_connections: usize,
    pub max_connections_per_origin: usize,
    pub max_subscriptions_per_client: usize,
    pub idle_timeout_ms: u64,
    pub last_catch_up: BTreeMap<JobId, CatchUpRecord>,
}

impl GatewayRegistry {
    /// Snapshot every counter under one lock acquisition.
    ///
    /// `idle_advisory` is the threshold for `idle_clients`; `None` reports 0.
    pub fn snapshot(
        &self,
        idle_timeout_ms: u64,
        idle_advisory: Option<Duration>,
        now: Instant,
    ) -> GatewaySnapshot {
        let tables = self.tables.lock();

        let idle_clients = idle_advisory.map_or(0, |threshold| {
            tables
                .connections
                .values()
                .filter(|e| e.conn.idle_for(now) >= threshold)
                .count()
        });
        let subscribers_per_job: BTreeMap<JobId, usize> = tables
            .jobs
            .iter()
            .map(|(job, subs)| (job.clone(), subs.len()))
            .collect();

        GatewaySnapshot {
            total_connections: tables.connections.len(),
            total_subscriptions: subscribers_per_job.values().sum(),
            connections_per_origin: tables
                .per_origin
                .iter()
                .map(|(origin, n)| (origin.clone(), *n))
                .collect(),
            subscribers_per_job,
            idle_clients,
            max_connections: self.limits.max_connections,
            max_connections_per_origin: self.limits.max_connections_per_origin,
            max_subscriptions_per_client: self.limits.max_subscriptions_per_client,
            idle_timeout_ms,
            last_catch_up: tables
                .last_catch_up
                .iter()
                .map(|(job, record)| (job.clone(), record.clone()))
                .collect(),
        }
    }
}
