use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventType};
use crate::run::{Checkpoint, Conversation, NewRun, Run, RunStatus};
use crate::store::{
    apply_claim, apply_outcome, apply_queued_cancel, apply_reclaim, check_append, ttl_delta,
    CancelOutcome, Finalized, Lease, Outcome, Reclaimed, Renewal, Store,
};

const DEFAULT_MAX_ACTIVE_RUNS: usize = 10_000;

/// Run, event and checkpoint tables of the in-memory store.
///
/// Plain data with no locking of its own; [`MemoryStore`] wraps it in one `RwLock`
/// so every method below runs as a single atomic step.
#[derive(Debug)]
pub struct RunTable {
    runs: HashMap<Uuid, Run>,
    /// Creation ordinal of every run, used as the FIFO key
    ordinals: HashMap<Uuid, u64>,
    /// Queued runs by creation ordinal
    queued: BTreeMap<u64, Uuid>,
    next_ordinal: u64,
    idempotency: HashMap<String, Uuid>,
    events: HashMap<Uuid, Vec<Event>>,
    checkpoints: HashMap<Uuid, Vec<Checkpoint>>,
    conversations: HashMap<Uuid, Conversation>,
    max_active_runs: usize,
}

impl Default for RunTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ACTIVE_RUNS)
    }

    /// Limit the number of non-terminal runs the table accepts.
    pub fn with_capacity(max_active_runs: usize) -> Self {
        Self {
            runs: HashMap::new(),
            ordinals: HashMap::new(),
            queued: BTreeMap::new(),
            next_ordinal: 0,
            idempotency: HashMap::new(),
            events: HashMap::new(),
            checkpoints: HashMap::new(),
            conversations: HashMap::new(),
            max_active_runs,
        }
    }

    pub fn insert(&mut self, new: NewRun) -> Result<Run> {
        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = self.idempotency.get(key).and_then(|id| self.runs.get(id)) {
                return Ok(existing.clone());
            }
        }
        if let Some(conversation_id) = new.conversation_id {
            if !self.conversations.contains_key(&conversation_id) {
                return Err(RuntimeError::ConversationNotFound(conversation_id));
            }
        }
        if self.active_len() >= self.max_active_runs {
            return Err(RuntimeError::QueueFull);
        }

        let run = Run::new(new);
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;

        if let Some(key) = &run.idempotency_key {
            self.idempotency.insert(key.clone(), run.id);
        }
        self.ordinals.insert(run.id, ordinal);
        self.queued.insert(ordinal, run.id);
        self.runs.insert(run.id, run.clone());
        Ok(run)
    }

    pub fn get(&self, run_id: &Uuid) -> Option<&Run> {
        self.runs.get(run_id)
    }

    fn get_mut(&mut self, run_id: &Uuid) -> Result<&mut Run> {
        self.runs
            .get_mut(run_id)
            .ok_or(RuntimeError::RunNotFound(*run_id))
    }

    /// All runs in creation order.
    pub fn all_runs(&self) -> Vec<&Run> {
        let mut runs: Vec<&Run> = self.runs.values().collect();
        runs.sort_by_key(|r| self.ordinals.get(&r.id).copied().unwrap_or(u64::MAX));
        runs
    }

    /// Number of runs that are not terminal yet.
    pub fn active_len(&self) -> usize {
        self.runs.values().filter(|r| !r.is_terminal()).count()
    }

    pub fn claim_next(
        &mut self,
        agent_keys: &[String],
        worker_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let candidate = self.queued.iter().find_map(|(ordinal, id)| {
            self.runs
                .get(id)
                .filter(|run| run.is_claimable(agent_keys, now))
                .map(|_| (*ordinal, *id))
        });
        let Some((ordinal, run_id)) = candidate else {
            return Ok(None);
        };

        let run = self.get_mut(&run_id)?;
        apply_claim(run, worker_id, lease_ttl, now)?;
        let claimed = run.clone();
        self.queued.remove(&ordinal);
        Ok(Some(claimed))
    }

    pub fn renew(&mut self, lease: &Lease, lease_ttl: Duration, now: DateTime<Utc>) -> Result<Renewal> {
        let Some(run) = self.runs.get_mut(&lease.run_id) else {
            return Ok(Renewal::Lost);
        };
        if !run.is_held_by(&lease.worker_id, lease.attempt) {
            return Ok(Renewal::Lost);
        }
        let expires_at = now + ttl_delta(lease_ttl)?;
        run.lease_expires_at = Some(expires_at);
        run.updated_at = now;
        Ok(Renewal::Renewed {
            expires_at,
            cancel_requested: run.cancel_requested_at.is_some(),
        })
    }

    pub fn finalize(&mut self, lease: &Lease, outcome: Outcome, now: DateTime<Utc>) -> Result<Finalized> {
        let run = self.get_mut(&lease.run_id)?;
        let (transition, terminal) = apply_outcome(run, lease, outcome, now)?;
        let run = run.clone();

        match (terminal, transition.terminal_event()) {
            (Some(payload), Some(event_type)) => {
                let event = self.push_event(run.id, event_type, payload, now);
                Ok(Finalized::Terminal { run, event })
            }
            _ => {
                self.requeue(run.id);
                Ok(Finalized::Requeued { run })
            }
        }
    }

    pub fn request_cancel(&mut self, run_id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let run = self.get_mut(&run_id)?;
        let status = run.status;
        match status {
            status if status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal(run.clone())),
            RunStatus::Queued => {
                let (transition, payload) = apply_queued_cancel(run, now)?;
                let run = run.clone();
                if let Some(ordinal) = self.ordinals.get(&run_id).copied() {
                    self.queued.remove(&ordinal);
                }
                let event_type = transition.terminal_event().unwrap_or(EventType::RunCancelled);
                let event = self.push_event(run_id, event_type, payload.unwrap_or_default(), now);
                Ok(CancelOutcome::Cancelled { run, event })
            }
            _ => {
                run.cancel_requested_at.get_or_insert(now);
                run.updated_at = now;
                Ok(CancelOutcome::Requested(run.clone()))
            }
        }
    }

    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<Reclaimed>> {
        let expired: Vec<Uuid> = self
            .runs
            .values()
            .filter(|run| run.lease_expired(now))
            .map(|run| run.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for run_id in expired {
            let run = self.get_mut(&run_id)?;
            let (transition, terminal) = apply_reclaim(run, now)?;
            let run = run.clone();
            match (terminal, transition.terminal_event()) {
                (Some(payload), Some(event_type)) => {
                    let event = self.push_event(run_id, event_type, payload, now);
                    reclaimed.push(Reclaimed::Terminal { run, event });
                }
                _ => {
                    self.requeue(run_id);
                    reclaimed.push(Reclaimed::Requeued {
                        run_id,
                        attempt: run.attempt,
                    });
                }
            }
        }
        Ok(reclaimed)
    }

    pub fn append(
        &mut self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
        fence: Option<&Lease>,
        now: DateTime<Utc>,
    ) -> Result<Event> {
        let run = self.runs.get(&run_id).ok_or(RuntimeError::RunNotFound(run_id))?;
        check_append(run, event_type, fence)?;
        Ok(self.push_event(run_id, event_type, payload, now))
    }

    pub fn events_since(&self, run_id: &Uuid, since_seq: u64) -> Vec<Event> {
        self.events
            .get(run_id)
            .map(|events| {
                // seq n lives at index n - 1
                let start = usize::try_from(since_seq).unwrap_or(usize::MAX).min(events.len());
                events[start..].to_vec()
            })
            .unwrap_or_default()
    }

    pub fn save_checkpoint(&mut self, lease: &Lease, state: Value, now: DateTime<Utc>) -> Result<Checkpoint> {
        let run = self.runs.get(&lease.run_id).ok_or(RuntimeError::RunNotFound(lease.run_id))?;
        if !run.is_held_by(&lease.worker_id, lease.attempt) {
            return Err(RuntimeError::LeaseLost(lease.run_id));
        }
        let checkpoints = self.checkpoints.entry(lease.run_id).or_default();
        let checkpoint = Checkpoint {
            run_id: lease.run_id,
            seq: checkpoints.len() as u64 + 1,
            state,
            created_at: now,
        };
        checkpoints.push(checkpoint.clone());
        Ok(checkpoint)
    }

    pub fn latest_checkpoint(&self, run_id: &Uuid) -> Option<Checkpoint> {
        self.checkpoints.get(run_id).and_then(|c| c.last().cloned())
    }

    pub fn insert_conversation(&mut self, conversation: Conversation) -> Conversation {
        self.conversations
            .entry(conversation.id)
            .or_insert(conversation)
            .clone()
    }

    pub fn conversation(&self, conversation_id: &Uuid) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    fn requeue(&mut self, run_id: Uuid) {
        if let Some(ordinal) = self.ordinals.get(&run_id).copied() {
            self.queued.insert(ordinal, run_id);
        }
    }

    fn push_event(&mut self, run_id: Uuid, event_type: EventType, payload: Value, now: DateTime<Utc>) -> Event {
        let events = self.events.entry(run_id).or_default();
        let event = Event {
            run_id,
            seq: events.len() as u64 + 1,
            event_type,
            payload,
            created_at: now,
        };
        events.push(event.clone());
        event
    }
}

/// [`Store`] over a process-local [`RunTable`].
///
/// Claims are an exchange under the table's write lock, so exclusivity holds between
/// every dispatcher sharing this instance but not across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<RunTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_active_runs: usize) -> Self {
        Self {
            table: RwLock::new(RunTable::with_capacity(max_active_runs)),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(&self, new: NewRun) -> Result<Run> {
        self.table.write().await.insert(new)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.table.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, conversation_id: Option<Uuid>) -> Result<Vec<Run>> {
        let table = self.table.read().await;
        Ok(table
            .all_runs()
            .into_iter()
            .filter(|r| conversation_id.is_none() || r.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        Ok(self.table.write().await.insert_conversation(conversation))
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.table.read().await.conversation(&conversation_id).cloned())
    }

    async fn try_claim_next(
        &self,
        agent_keys: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Run>> {
        self.table
            .write()
            .await
            .claim_next(agent_keys, worker_id, lease_ttl, Utc::now())
    }

    async fn renew_lease(&self, lease: &Lease, lease_ttl: Duration) -> Result<Renewal> {
        self.table.write().await.renew(lease, lease_ttl, Utc::now())
    }

    async fn finalize(&self, lease: &Lease, outcome: Outcome) -> Result<Finalized> {
        self.table.write().await.finalize(lease, outcome, Utc::now())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        self.table.write().await.request_cancel(run_id, Utc::now())
    }

    async fn reclaim_expired_leases(&self) -> Result<Vec<Reclaimed>> {
        self.table.write().await.reclaim_expired(Utc::now())
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
        fence: Option<&Lease>,
    ) -> Result<Event> {
        self.table
            .write()
            .await
            .append(run_id, event_type, payload, fence, Utc::now())
    }

    async fn read_events(&self, run_id: Uuid, since_seq: u64) -> Result<Vec<Event>> {
        Ok(self.table.read().await.events_since(&run_id, since_seq))
    }

    async fn save_checkpoint(&self, lease: &Lease, state: Value) -> Result<Checkpoint> {
        self.table
            .write()
            .await
            .save_checkpoint(lease, state, Utc::now())
    }

    async fn latest_checkpoint(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        Ok(self.table.read().await.latest_checkpoint(&run_id))
    }
}
