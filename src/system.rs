//! Owns one event bus and one task queue and orders their lifecycle.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::bus::EventBus;
use crate::config::SystemConfig;
use crate::error::Result;
use crate::queue::TaskQueue;
use crate::store::{EventStore, PgEventStore};

/// Bus plus queue over a shared store.
///
/// Callers create one per process and hand out [`EventBus`] / [`TaskQueue`]
/// clones; there is no global instance.
pub struct EventSystemManager {
    bus: EventBus,
    queue: TaskQueue,
    initialized: Mutex<bool>,
}

impl EventSystemManager {
    pub fn new(store: Arc<dyn EventStore>, config: SystemConfig) -> Self {
        let bus = EventBus::new(store, config.bus);
        let queue = TaskQueue::new(bus.clone(), config.queue);
        Self {
            bus,
            queue,
            initialized: Mutex::new(false),
        }
    }

    /// Connect to Postgres and build a manager over a [`PgEventStore`].
    pub async fn connect_postgres(database_url: &str, config: SystemConfig) -> Result<Self> {
        let store = PgEventStore::connect(database_url).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Prepare the store, then start the bus and the queue. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }
        self.bus.initialize().await?;
        self.bus.start();
        self.queue.start();
        *initialized = true;
        info!("event system initialized");
        Ok(())
    }

    /// Stop the queue, then the bus. Idempotent.
    pub async fn shutdown(&self) {
        let mut initialized = self.initialized.lock().await;
        if !*initialized {
            return;
        }
        self.queue.stop().await;
        self.bus.stop().await;
        *initialized = false;
        info!("event system shut down");
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn task_queue(&self) -> &TaskQueue {
        &self.queue
    }
}
