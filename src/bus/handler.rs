//! Event handlers and the subscription registry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::model::{Event, EventType};

/// Something that reacts to an event. Returning an error marks the
/// dispatch as failed and triggers a delivery retry, so handlers should be
/// idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Entry = (SubscriptionId, Arc<dyn EventHandler>);

/// Handlers keyed by event type, plus handlers for every type.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: u64,
    by_type: HashMap<EventType, Vec<Entry>>,
    global: Vec<Entry>,
}

impl HandlerRegistry {
    /// Register `handler` for one type, or for all types when `event_type` is None.
    pub fn add(
        &mut self,
        event_type: Option<EventType>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        match event_type {
            Some(t) => self.by_type.entry(t).or_default().push((id, handler)),
            None => self.global.push((id, handler)),
        }
        id
    }

    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        self.global.retain(|(sid, _)| *sid != id);
        for entries in self.by_type.values_mut() {
            entries.retain(|(sid, _)| *sid != id);
        }
        self.by_type.retain(|_, entries| !entries.is_empty());
        self.len() < before
    }

    /// Type-specific handlers in registration order, then global handlers.
    pub fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.by_type
            .get(&event_type)
            .into_iter()
            .flatten()
            .chain(self.global.iter())
            .map(|(_, h)| Arc::clone(h))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.by_type.values().map(Vec::len).sum::<usize>()
    }
}
