//! Method and topic dispatch registries.
//!
//! Inbound requests resolve through the [`MethodRegistry`]; inbound events
//! resolve through the [`TopicRegistry`], whose handlers are keyed by topic
//! patterns and selected most-specific-first like protected rooms.

use crate::connection::Connection;
use futures_util::future::BoxFuture;
use helios_protocol::{pattern, EventMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Context carried into a method handler.
pub struct HandlerCtx {
    pub connection: Arc<Connection>,
    pub payload: serde_json::Value,
}

/// Context carried into a topic handler.
pub struct EventCtx {
    pub connection: Arc<Connection>,
    pub topic: String,
    pub captures: Vec<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerFailure {
    #[error("method not found")]
    MethodNotFound,
    #[error("{0}")]
    Failed(String),
}

pub type MethodHandler =
    Arc<dyn Fn(HandlerCtx) -> BoxFuture<'static, Result<serde_json::Value, HandlerFailure>> + Send + Sync>;

pub type EventHandler = Arc<dyn Fn(EventCtx) -> BoxFuture<'static, ()> + Send + Sync>;

/// RPC handlers keyed by method name.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: RwLock<HashMap<String, MethodHandler>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        method: impl Into<String>,
        handler: impl Fn(HandlerCtx) -> BoxFuture<'static, Result<serde_json::Value, HandlerFailure>>
            + Send
            + Sync
            + 'static,
    ) {
        self.handlers
            .write()
            .await
            .insert(method.into(), Arc::new(handler));
    }

    /// Invoke the handler for `method`.  Handler failures come back as
    /// values; nothing propagates past the caller.
    pub async fn dispatch(
        &self,
        method: &str,
        ctx: HandlerCtx,
    ) -> Result<serde_json::Value, HandlerFailure> {
        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(method).cloned()
        };
        match handler {
            Some(handler) => handler(ctx).await,
            None => Err(HandlerFailure::MethodNotFound),
        }
    }
}

struct TopicBinding {
    pattern: String,
    specificity: u32,
    handler: EventHandler,
}

/// Inbound-event handlers keyed by topic pattern.
#[derive(Default)]
pub struct TopicRegistry {
    bindings: RwLock<Vec<TopicBinding>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        topic_pattern: impl Into<String>,
        handler: impl Fn(EventCtx) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        let topic_pattern = topic_pattern.into();
        let mut bindings = self.bindings.write().await;
        bindings.push(TopicBinding {
            specificity: pattern::specificity(&topic_pattern),
            pattern: topic_pattern,
            handler: Arc::new(handler),
        });
        bindings.sort_by(|a, b| b.specificity.cmp(&a.specificity));
    }

    /// Route an inbound event to the most specific matching handler;
    /// unmatched events are dropped with a log line.
    pub async fn dispatch(&self, connection: Arc<Connection>, event: EventMessage) {
        let matched = {
            let bindings = self.bindings.read().await;
            bindings.iter().find_map(|binding| {
                pattern::match_topic(&event.topic, &binding.pattern)
                    .map(|captures| (binding.handler.clone(), captures))
            })
        };
        let Some((handler, captures)) = matched else {
            debug!(topic = %event.topic, "event matched no topic handler");
            return;
        };
        handler(EventCtx {
            connection,
            topic: event.topic,
            captures,
            payload: event.payload,
        })
        .await;
    }
}

/// The pair of registries a connection dispatches through.
#[derive(Clone)]
pub struct DispatchContext {
    pub methods: Arc<MethodRegistry>,
    pub topics: Arc<TopicRegistry>,
}
