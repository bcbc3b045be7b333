//! Connection ownership and lookup.
//!
//! The registry owns every [`Connection`] and maps each live transport
//! handle and each bound session id to it.  Connections whose transport
//! closed but whose session has not expired live in the disconnected set
//! until a reconnect claims them or the sweep collects them.
//!
//! Index discipline: a connection is reachable by at most one transport
//! handle, and a disconnected entry is never also transport-indexed.

use crate::connection::{Connection, Transport, TransportId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::debug;

pub struct DisconnectedEntry {
    pub connection: Arc<Connection>,
    pub expires_at: Instant,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    by_transport: RwLock<HashMap<TransportId, Arc<Connection>>>,
    by_session: RwLock<HashMap<String, Arc<Connection>>>,
    disconnected: RwLock<HashMap<String, DisconnectedEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a fresh connection and index it under its transport.
    pub async fn register(&self, transport: Transport) -> Arc<Connection> {
        let transport_id = transport.id;
        let conn = Connection::new(transport);
        self.by_transport
            .write()
            .await
            .insert(transport_id, conn.clone());
        conn
    }

    pub async fn get(&self, transport_id: TransportId) -> Option<Arc<Connection>> {
        self.by_transport.read().await.get(&transport_id).cloned()
    }

    /// Bind a session id to an active connection and index it.
    pub async fn bind_session(&self, conn: &Arc<Connection>, session_id: &str) -> bool {
        if !conn.bind_session_id(session_id).await {
            return false;
        }
        self.by_session
            .write()
            .await
            .insert(session_id.to_owned(), conn.clone());
        true
    }

    /// An active connection under this session id, else an unexpired
    /// disconnected one, else nothing.
    pub async fn find_by_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        {
            let disconnected = self.disconnected.read().await;
            if let Some(entry) = disconnected.get(session_id) {
                if entry.expires_at <= Instant::now() {
                    // Expired but not yet swept: not recoverable.
                    return None;
                }
                return Some(entry.connection.clone());
            }
        }
        self.by_session.read().await.get(session_id).cloned()
    }

    /// Rebind a recoverable session onto a new transport.
    ///
    /// Removes any disconnected entry, unindexes the old transport if still
    /// present, swaps the transport on the connection, and indexes the new
    /// handle.
    pub async fn reconnect(
        &self,
        session_id: &str,
        new_transport: Transport,
    ) -> Option<Arc<Connection>> {
        let conn = self.find_by_session(session_id).await?;
        self.disconnected.write().await.remove(session_id);
        if let Some(old_transport) = conn.transport_id().await {
            self.by_transport.write().await.remove(&old_transport);
        }
        let new_id = new_transport.id;
        conn.reconnect(new_transport).await;
        self.by_transport.write().await.insert(new_id, conn.clone());
        Some(conn)
    }

    /// Move a session-bearing connection into the disconnected set.
    ///
    /// Connections without a session id are not recoverable under this path
    /// and must be fully removed instead.
    pub async fn mark_disconnected(
        &self,
        transport_id: TransportId,
        ttl: Duration,
    ) -> Option<Arc<Connection>> {
        let session_id = {
            let by_transport = self.by_transport.read().await;
            let conn = by_transport.get(&transport_id)?;
            conn.session_id().await?
        };
        let conn = self.by_transport.write().await.remove(&transport_id)?;
        self.disconnected.write().await.insert(
            session_id,
            DisconnectedEntry {
                connection: conn.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Some(conn)
    }

    /// Drop a connection from every index.
    pub async fn remove(&self, transport_id: TransportId) -> Option<Arc<Connection>> {
        let conn = self.by_transport.write().await.remove(&transport_id)?;
        if let Some(session_id) = conn.session_id().await {
            self.by_session.write().await.remove(&session_id);
            self.disconnected.write().await.remove(&session_id);
        }
        Some(conn)
    }

    /// Remove and return every disconnected entry past its TTL.
    ///
    /// Locks are held only while collecting; the caller runs final cleanup
    /// outside, so the sweep never blocks incoming traffic.
    pub async fn collect_expired(&self) -> Vec<Arc<Connection>> {
        let now = Instant::now();
        let expired: Vec<(String, Arc<Connection>)> = {
            let mut disconnected = self.disconnected.write().await;
            let keys: Vec<String> = disconnected
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(session_id, _)| session_id.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    disconnected
                        .remove(&key)
                        .map(|entry| (key, entry.connection))
                })
                .collect()
        };
        if expired.is_empty() {
            return Vec::new();
        }
        let mut by_session = self.by_session.write().await;
        let mut out = Vec::with_capacity(expired.len());
        for (session_id, conn) in expired {
            by_session.remove(&session_id);
            debug!(session_id = %session_id, connection_id = %conn.id(), "session expired");
            out.push(conn);
        }
        out
    }

    pub async fn active_count(&self) -> usize {
        self.by_transport.read().await.len()
    }

    pub async fn disconnected_count(&self) -> usize {
        self.disconnected.read().await.len()
    }
}
