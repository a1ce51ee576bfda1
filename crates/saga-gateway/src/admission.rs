//! Admission control: global and per-origin connection caps.

use std::collections::HashSet;
use std::sync::Arc;

use saga_core::{ConnectionId, GatewayError};
use tracing::debug;

use crate::connection::ClientConnection;
use crate::registry::{Entry, GatewayRegistry};

impl GatewayRegistry {
    /// Admit a candidate connection, or reject it leaving every counter untouched.
    pub fn admit(&self, conn: Arc<ClientConnection>) -> Result<(), GatewayError> {
        let limits = self.limits;
        let mut tables = self.tables.lock();
        // Checked under the lock so a drain's connection listing sees every admit.
        if self.is_draining() {
            return Err(GatewayError::ShuttingDown);
        }

        if limits.max_connections > 0 && tables.connections.len() >= limits.max_connections {
            return Err(GatewayError::ConnectionLimit { limit: limits.max_connections });
        }
        let from_origin = tables.per_origin.get(&conn.origin).copied().unwrap_or(0);
        if limits.max_connections_per_origin > 0 && from_origin >= limits.max_connections_per_origin {
            return Err(GatewayError::OriginLimit {
                origin: conn.origin.clone(),
                limit: limits.max_connections_per_origin,
            });
        }

        conn.touch();
        *tables.per_origin.entry(conn.origin.clone()).or_insert(0) += 1;
        tables.connections.insert(
            conn.id.clone(),
            Entry {
                conn,
                jobs: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a connection and every subscription it holds.
    ///
    /// Returns the removed connection, or `None` if it was already gone, so
    /// concurrent callers (idle sweep and socket teardown) release it once.
    pub fn release(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut tables = self.tables.lock();
        let entry = tables.connections.remove(id)?;

        if let Some(count) = tables.per_origin.get_mut(&entry.conn.origin) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                tables.per_origin.remove(&entry.conn.origin);
            }
        }
        for job in &entry.jobs {
            if let Some(subscribers) = tables.jobs.get_mut(job) {
                subscribers.remove(id);
                if subscribers.is_empty() {
                    tables.jobs.remove(job);
                }
            }
        }
        debug!(conn_id = %id, released_jobs = entry.jobs.len(), "connection released");
        Some(entry.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Limits;
    use saga_core::JobId;

    fn candidate(origin: &str) -> Arc<ClientConnection> {
        let (conn, _rx) = ClientConnection::open(ConnectionId::new(), origin, 8);
        Arc::new(conn)
    }

    fn registry(max_connections: usize, per_origin: usize) -> GatewayRegistry {
        GatewayRegistry::new(Limits {
            max_connections,
            max_connections_per_origin: per_origin,
            max_subscriptions_per_client: 0,
        })
    }

    #[test]
    fn burst_admits_exactly_the_limit() {
        let registry = registry(5, 0);
        let results: Vec<_> = (0..8).map(|_| registry.admit(candidate("o"))).collect();
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(accepted, 5);
        for err in results.into_iter().filter_map(Result::err) {
            assert!(matches!(err, GatewayError::ConnectionLimit { limit: 5 }));
            assert!(!err.to_string().is_empty());
        }
        assert_eq!(registry.connection_count(), 5);
        registry.assert_consistent();
    }

    #[test]
    fn zero_limit_means_unbounded() {
        let registry = registry(0, 0);
        for _ in 0..50 {
            registry.admit(candidate("o")).unwrap();
        }
        assert_eq!(registry.connection_count(), 50);
    }

    #[test]
    fn origin_cap_is_per_origin() {
        let registry = registry(0, 2);
        registry.admit(candidate("https://a")).unwrap();
        registry.admit(candidate("https://a")).unwrap();
        let err = registry.admit(candidate("https://a")).unwrap_err();
        assert!(matches!(err, GatewayError::OriginLimit { ref origin, limit: 2 } if origin == "https://a"));
        registry.admit(candidate("https://b")).unwrap();
        assert_eq!(registry.tables.lock().per_origin.get("https://a"), Some(&2));
        registry.assert_consistent();
    }

    #[test]
    fn rejection_leaves_counters_untouched() {
        let registry = registry(1, 0);
        registry.admit(candidate("https://a")).unwrap();
        let _ = registry.admit(candidate("https://b")).unwrap_err();
        let tables = registry.tables.lock();
        assert_eq!(tables.connections.len(), 1);
        assert!(!tables.per_origin.contains_key("https://b"));
    }

    #[test]
    fn release_is_idempotent() {
        let registry = registry(0, 0);
        let conn = candidate("https://a");
        registry.admit(Arc::clone(&conn)).unwrap();
        assert!(registry.release(&conn.id).is_some());
        assert!(registry.release(&conn.id).is_none());
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.tables.lock().per_origin.is_empty());
    }

    #[test]
    fn release_frees_capacity_and_subscriptions() {
        let registry = registry(1, 0);
        let conn = candidate("o");
        registry.admit(Arc::clone(&conn)).unwrap();
        let job = JobId::parse("job-1").unwrap();
        let _ = registry.subscribe(&conn.id, &job).unwrap();
        registry.release(&conn.id);
        assert!(registry.subscribers_of(&job).is_empty());
        assert!(registry.tables.lock().jobs.is_empty());
        registry.admit(candidate("o")).unwrap();
        registry.assert_consistent();
    }

    #[test]
    fn draining_rejects_new_connections() {
        let registry = registry(0, 0);
        registry.begin_drain();
        assert_eq!(registry.admit(candidate("o")).unwrap_err(), GatewayError::ShuttingDown);
    }
}
