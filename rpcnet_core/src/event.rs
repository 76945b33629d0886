//! Event and messaging system.
//!
//! This is a small typed event bus used for connection lifecycle
//! notifications — session established, closed, or degraded — that callers
//! may want to observe without threading a callback through every layer.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::message::Health;

/// A connection lifecycle notification, pushed onto an [`EventBus`] by the
/// endpoint and connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    SessionEstablished { server_id: String },
    SessionClosed { server_id: String, reason: String },
    HealthChanged { server_id: String, health: Health },
}

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    /// Pushes an event into the queue.
    pub fn push<E: 'static + Send + Sync>(&mut self, e: E) {
        let q = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        let q = q.downcast_mut::<Vec<E>>().expect("queue type mismatch");
        q.push(e);
    }

    /// Drains all queued events of a type.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }
}
