//! Caller-facing entry points: create, inspect, cancel and observe runs.

use std::sync::Arc;

use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::config::{QueueBackend, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::events::{EventBus, EventStream};
use crate::lease::LeaseManager;
use crate::run::{Checkpoint, Conversation, NewRun, Run};
use crate::store::{CancelOutcome, MemoryStore, SqliteStore, Store};
use crate::worker::CancelRegistry;

/// Build the store selected by `backend`.
pub fn open_store(backend: &QueueBackend) -> Result<Arc<dyn Store>> {
    match backend {
        QueueBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        QueueBackend::Sqlite(path) => Ok(Arc::new(SqliteStore::open(path)?)),
    }
}

/// Shared handle on one store, its event bus and the runs executing in this process.
///
/// Cheap to clone. Workers built from the same runtime receive in-process cancels
/// immediately; others notice the store flag on their next check.
#[derive(Clone)]
pub struct Runtime {
    config: Arc<RuntimeConfig>,
    store: Arc<dyn Store>,
    bus: EventBus,
    leases: LeaseManager,
    cancels: CancelRegistry,
}

impl Runtime {
    pub fn new(store: Arc<dyn Store>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let bus = EventBus::from_config(store.clone(), &config);
        let leases = LeaseManager::new(store.clone(), bus.clone(), config.lease_ttl);
        Ok(Self {
            config: Arc::new(config),
            store,
            bus,
            leases,
            cancels: CancelRegistry::new(),
        })
    }

    /// Open the configured store and build a runtime over it.
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        let store = open_store(&config.queue_backend)?;
        tracing::debug!(backend = ?config.queue_backend, bus = ?config.event_bus_backend, "Runtime opened");
        Self::new(store, config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Enqueue a run. Missing `max_attempts` takes the configured default.
    pub async fn create_run(&self, mut new: NewRun) -> Result<Run> {
        if new.agent_key.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest("agent key must not be empty".into()));
        }
        if new.max_attempts == Some(0) {
            return Err(RuntimeError::InvalidRequest("max attempts must be at least 1".into()));
        }
        new.max_attempts.get_or_insert(self.config.max_attempts);

        let run = self.store.create_run(new).await?;
        tracing::info!(
            run_id = %run.id,
            agent_key = %run.agent_key,
            max_attempts = run.max_attempts,
            status = %run.status,
            "Run queued"
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or(RuntimeError::RunNotFound(run_id))
    }

    pub async fn list_runs(&self, conversation_id: Option<Uuid>) -> Result<Vec<Run>> {
        self.store.list_runs(conversation_id).await
    }

    /// Cancel a run. Idempotent: a finished run is returned unchanged.
    ///
    /// A queued run is cancelled immediately. A running one is flagged and its holder
    /// stops it within the cancel check interval plus the grace period.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        match self.store.request_cancel(run_id).await? {
            CancelOutcome::AlreadyTerminal(run) => {
                tracing::debug!(run_id = %run_id, status = %run.status, "Cancel ignored, run already finished");
                Ok(run)
            }
            CancelOutcome::Cancelled { run, event } => {
                tracing::info!(run_id = %run_id, "Queued run cancelled");
                self.bus.announce(&event);
                Ok(run)
            }
            CancelOutcome::Requested(run) => {
                let local = self.cancels.cancel(&run_id);
                tracing::info!(run_id = %run_id, worker_id = ?run.lease_owner, local, "Cancellation requested");
                Ok(run)
            }
        }
    }

    /// Events after `since_seq`, replayed then live, ending with the terminal event.
    pub async fn stream_events(&self, run_id: Uuid, since_seq: u64) -> Result<EventStream> {
        self.bus.subscribe(run_id, since_seq).await
    }

    /// Follow the run's events to the end and return the finished run.
    pub async fn wait_for_completion(&self, run_id: Uuid) -> Result<Run> {
        let mut events = self.stream_events(run_id, 0).await?;
        while let Some(event) = events.next().await {
            event?;
        }
        self.get_run(run_id).await
    }

    pub async fn create_conversation(
        &self,
        agent_key: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Conversation> {
        let conversation = self
            .store
            .create_conversation(Conversation::new(agent_key, title))
            .await?;
        tracing::info!(conversation_id = %conversation.id, agent_key = %conversation.agent_key, "Conversation created");
        Ok(conversation)
    }

    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or(RuntimeError::ConversationNotFound(conversation_id))
    }

    pub async fn latest_checkpoint(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        self.store.latest_checkpoint(run_id).await
    }
}
