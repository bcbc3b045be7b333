//! Declared rooms, subscription indexes, validators, broadcast fan-out.
//!
//! Undeclared topics are deny-by-default.  Public rooms are exact topics;
//! protected rooms are patterns over the `:`-delimited namespace and gate
//! subscription through an async validator that receives the pattern's
//! captures.
//!
//! The two subscription indexes are mutated together under both write locks
//! and are strictly consistent: a (connection, topic) pair is in both or in
//! neither.

use crate::connection::{Connection, ConnectionState};
use crate::events::{EventBus, ServerEvent};
use futures_util::future::BoxFuture;
use helios_protocol::{error_codes, pattern};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Public,
    Protected,
}

/// Context handed to a room validator.
pub struct ValidatorCtx {
    pub connection: Arc<Connection>,
    /// Wildcard captures from matching the subscribed topic against the
    /// room's pattern, left to right.
    pub captures: Vec<String>,
    /// Application data supplied with the subscribe call.
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ValidatorFailure(pub String);

pub type Validator =
    Arc<dyn Fn(ValidatorCtx) -> BoxFuture<'static, Result<bool, ValidatorFailure>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeclareError {
    #[error("room pattern must be a non-empty string")]
    EmptyPattern,
    #[error("public room patterns may not contain wildcards")]
    WildcardInPublic,
    #[error("protected rooms require a validator")]
    MissingValidator,
}

/// Structured subscribe result; failures are returned, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    Rejected {
        code: &'static str,
        error: &'static str,
    },
}

impl SubscribeOutcome {
    pub fn is_subscribed(&self) -> bool {
        matches!(self, SubscribeOutcome::Subscribed)
    }

    /// The `{ok, error?}` payload shape returned by the subscribe RPC.
    pub fn to_payload(&self) -> serde_json::Value {
        match self {
            SubscribeOutcome::Subscribed => serde_json::json!({ "ok": true }),
            SubscribeOutcome::Rejected { code, error } => {
                serde_json::json!({ "ok": false, "code": code, "error": error })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Distinct subscribed connections the broadcast resolved to.
    pub targets: usize,
    /// How many of them were OPEN and accepted the write.
    pub sent: usize,
}

struct ProtectedRoom {
    pattern: String,
    specificity: u32,
    validator: Validator,
}

struct ConnEntry {
    conn: Weak<Connection>,
    topics: HashSet<String>,
}

enum RoomAccess {
    Public,
    Protected {
        captures: Vec<String>,
        validator: Validator,
    },
}

pub struct RoomBroker {
    bus: EventBus,
    public_rooms: RwLock<HashSet<String>>,
    /// Sorted by specificity descending; declaration order breaks ties.
    protected_rooms: RwLock<Vec<ProtectedRoom>>,
    by_connection: RwLock<HashMap<Uuid, ConnEntry>>,
    by_topic: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl RoomBroker {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            public_rooms: RwLock::new(HashSet::new()),
            protected_rooms: RwLock::new(Vec::new()),
            by_connection: RwLock::new(HashMap::new()),
            by_topic: RwLock::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Declaration
    // -----------------------------------------------------------------------

    /// Declare a room; chainable.
    pub async fn declare(
        &self,
        room_pattern: &str,
        kind: RoomKind,
        validator: Option<Validator>,
    ) -> Result<&Self, DeclareError> {
        if room_pattern.is_empty() {
            return Err(DeclareError::EmptyPattern);
        }
        match kind {
            RoomKind::Public => {
                if pattern::has_wildcard(room_pattern) {
                    return Err(DeclareError::WildcardInPublic);
                }
                self.public_rooms
                    .write()
                    .await
                    .insert(room_pattern.to_owned());
            }
            RoomKind::Protected => {
                let validator = validator.ok_or(DeclareError::MissingValidator)?;
                let mut rooms = self.protected_rooms.write().await;
                rooms.push(ProtectedRoom {
                    pattern: room_pattern.to_owned(),
                    specificity: pattern::specificity(room_pattern),
                    validator,
                });
                // Stable: declaration order survives among equal scores.
                rooms.sort_by(|a, b| b.specificity.cmp(&a.specificity));
            }
        }
        Ok(self)
    }

    /// Exact public match first, else the most specific matching protected
    /// pattern.
    async fn resolve_room(&self, topic: &str) -> Option<RoomAccess> {
        if self.public_rooms.read().await.contains(topic) {
            return Some(RoomAccess::Public);
        }
        let rooms = self.protected_rooms.read().await;
        for room in rooms.iter() {
            if let Some(captures) = pattern::match_topic(topic, &room.pattern) {
                return Some(RoomAccess::Protected {
                    captures,
                    validator: room.validator.clone(),
                });
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Subscription
    // -----------------------------------------------------------------------

    pub async fn subscribe(
        &self,
        conn: &Arc<Connection>,
        topic: &str,
        data: Option<serde_json::Value>,
    ) -> SubscribeOutcome {
        let Some(access) = self.resolve_room(topic).await else {
            return SubscribeOutcome::Rejected {
                code: error_codes::ROOM_UNDECLARED,
                error: "Room not declared (deny by default)",
            };
        };

        if let RoomAccess::Protected {
            captures,
            validator,
        } = access
        {
            let ctx = ValidatorCtx {
                connection: conn.clone(),
                captures,
                data,
            };
            match validator(ctx).await {
                Err(failure) => {
                    warn!(connection_id = %conn.id(), topic, error = %failure, "room validator failed");
                    return SubscribeOutcome::Rejected {
                        code: error_codes::VALIDATOR_ERROR,
                        error: "Validator error",
                    };
                }
                Ok(false) => {
                    return SubscribeOutcome::Rejected {
                        code: error_codes::PERMISSION_DENIED,
                        error: "Permission denied",
                    };
                }
                Ok(true) => {}
            }
        }

        // The validator may have suspended; re-check liveness before
        // touching the indexes.
        if conn.state().await != ConnectionState::Open {
            return SubscribeOutcome::Rejected {
                code: error_codes::CONNECTION_CLOSED,
                error: "Connection closed",
            };
        }

        {
            let mut by_connection = self.by_connection.write().await;
            let mut by_topic = self.by_topic.write().await;
            by_connection
                .entry(conn.id())
                .or_insert_with(|| ConnEntry {
                    conn: Arc::downgrade(conn),
                    topics: HashSet::new(),
                })
                .topics
                .insert(topic.to_owned());
            by_topic
                .entry(topic.to_owned())
                .or_default()
                .insert(conn.id());
        }
        conn.add_subscription(topic).await;
        let _ = self.bus.send(ServerEvent::RoomSubscribed {
            connection: conn.clone(),
            topic: topic.to_owned(),
        });
        SubscribeOutcome::Subscribed
    }

    /// Returns whether anything was removed; empty index sets are pruned.
    pub async fn unsubscribe(&self, conn: &Arc<Connection>, topic: &str) -> bool {
        let removed = {
            let mut by_connection = self.by_connection.write().await;
            let mut by_topic = self.by_topic.write().await;

            let mut removed = false;
            let mut entry_empty = false;
            if let Some(entry) = by_connection.get_mut(&conn.id()) {
                removed = entry.topics.remove(topic);
                entry_empty = entry.topics.is_empty();
            }
            if entry_empty {
                by_connection.remove(&conn.id());
            }

            let topic_empty = by_topic
                .get_mut(topic)
                .map(|ids| {
                    removed |= ids.remove(&conn.id());
                    ids.is_empty()
                })
                .unwrap_or(false);
            if topic_empty {
                by_topic.remove(topic);
            }
            removed
        };

        if removed {
            conn.remove_subscription(topic).await;
            let _ = self.bus.send(ServerEvent::RoomUnsubscribed {
                connection: conn.clone(),
                topic: topic.to_owned(),
            });
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    /// Fan an event out to every connection subscribed to `topic`, either
    /// exactly or through a subscribed topic matching it as a pattern.
    ///
    /// The delivered event carries the broadcast argument verbatim as its
    /// topic, even when it is a pattern.
    pub async fn broadcast(&self, topic: &str, data: &serde_json::Value) -> BroadcastReport {
        let targets: HashMap<Uuid, Arc<Connection>> = {
            let by_connection = self.by_connection.read().await;
            let by_topic = self.by_topic.read().await;

            let mut targets = HashMap::new();
            if let Some(ids) = by_topic.get(topic) {
                for id in ids {
                    if let Some(conn) = by_connection.get(id).and_then(|e| e.conn.upgrade()) {
                        targets.insert(*id, conn);
                    }
                }
            }
            for (id, entry) in by_connection.iter() {
                if targets.contains_key(id) {
                    continue;
                }
                if entry
                    .topics
                    .iter()
                    .any(|subscribed| pattern::match_topic(subscribed, topic).is_some())
                {
                    if let Some(conn) = entry.conn.upgrade() {
                        targets.insert(*id, conn);
                    }
                }
            }
            targets
        };

        let mut sent = 0;
        for conn in targets.values() {
            if conn.emit(topic, data.clone()).await.is_ok() {
                sent += 1;
            }
        }
        BroadcastReport {
            targets: targets.len(),
            sent,
        }
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    /// Remove every pair referencing the connection from both indexes.
    pub async fn cleanup(&self, conn: &Arc<Connection>) {
        {
            let mut by_connection = self.by_connection.write().await;
            let mut by_topic = self.by_topic.write().await;
            if let Some(entry) = by_connection.remove(&conn.id()) {
                for topic in &entry.topics {
                    let empty = by_topic
                        .get_mut(topic)
                        .map(|ids| {
                            ids.remove(&conn.id());
                            ids.is_empty()
                        })
                        .unwrap_or(false);
                    if empty {
                        by_topic.remove(topic);
                    }
                }
            }
        }
        conn.clear_subscriptions().await;
    }

    /// Index consistency probe: (c, t) in `by_topic` ⇔ t in `by_connection[c]`.
    #[cfg(test)]
    async fn indexes_consistent(&self) -> bool {
        let by_connection = self.by_connection.read().await;
        let by_topic = self.by_topic.read().await;
        let forward = by_connection.iter().all(|(id, entry)| {
            entry
                .topics
                .iter()
                .all(|t| by_topic.get(t).is_some_and(|ids| ids.contains(id)))
        });
        let backward = by_topic.iter().all(|(topic, ids)| {
            ids.iter().all(|id| {
                by_connection
                    .get(id)
                    .is_some_and(|entry| entry.topics.contains(topic))
            })
        });
        forward && backward
    }
}
