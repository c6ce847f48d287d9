use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventType};
use crate::run::{Checkpoint, Conversation, NewRun, Run, RunError, RunStatus};
use crate::store::{
    apply_claim, apply_outcome, apply_queued_cancel, apply_reclaim, check_append, ttl_delta,
    CancelOutcome, Finalized, Lease, Outcome, Reclaimed, Renewal, Store,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    agent_key TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    ordinal INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    agent_key TEXT NOT NULL,
    conversation_id TEXT REFERENCES conversations(id),
    input TEXT NOT NULL,
    output TEXT,
    error TEXT,
    status TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    lease_owner TEXT,
    lease_expires_at_ms INTEGER,
    idempotency_key TEXT UNIQUE,
    cancel_requested_at_ms INTEGER,
    available_at_ms INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    started_at_ms INTEGER,
    finished_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_runs_claim ON runs(status, available_at_ms, ordinal);
CREATE INDEX IF NOT EXISTS idx_runs_lease ON runs(status, lease_expires_at_ms);
CREATE TABLE IF NOT EXISTS events (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (run_id, seq)
);
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    state TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    PRIMARY KEY (run_id, seq)
);
";

const RUN_COLUMNS: &str = "id, agent_key, conversation_id, input, output, error, status, attempt, \
     max_attempts, lease_owner, lease_expires_at_ms, idempotency_key, cancel_requested_at_ms, \
     available_at_ms, created_at_ms, updated_at_ms, started_at_ms, finished_at_ms";

/// [`Store`] over a SQLite database file.
///
/// Every mutation runs in a `BEGIN IMMEDIATE` transaction, which takes the database
/// write lock up front. Concurrent claimants in this or any other process therefore
/// serialize on the claim, and each queued row is handed out at most once.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // in-memory databases report "memory" and keep their journal mode
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the blocking pool with exclusive use of the connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| RuntimeError::Internal("sqlite connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| RuntimeError::Internal(format!("sqlite task failed: {}", e)))?
    }
}

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// Current time truncated to the millisecond precision stored on disk.
fn now_ms() -> DateTime<Utc> {
    ms_to_dt(dt_to_ms(Utc::now())).unwrap_or_else(|_| Utc::now())
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RuntimeError::Store(format!("timestamp out of range: {}", ms)))
}

fn opt_ms_to_dt(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(ms_to_dt).transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| RuntimeError::Store(format!("bad uuid '{}': {}", raw, e)))
}

/// Column values of one `runs` row before decoding.
struct RawRun {
    id: String,
    agent_key: String,
    conversation_id: Option<String>,
    input: String,
    output: Option<String>,
    error: Option<String>,
    status: String,
    attempt: u32,
    max_attempts: u32,
    lease_owner: Option<String>,
    lease_expires_at_ms: Option<i64>,
    idempotency_key: Option<String>,
    cancel_requested_at_ms: Option<i64>,
    available_at_ms: i64,
    created_at_ms: i64,
    updated_at_ms: i64,
    started_at_ms: Option<i64>,
    finished_at_ms: Option<i64>,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            agent_key: row.get(1)?,
            conversation_id: row.get(2)?,
            input: row.get(3)?,
            output: row.get(4)?,
            error: row.get(5)?,
            status: row.get(6)?,
            attempt: row.get(7)?,
            max_attempts: row.get(8)?,
            lease_owner: row.get(9)?,
            lease_expires_at_ms: row.get(10)?,
            idempotency_key: row.get(11)?,
            cancel_requested_at_ms: row.get(12)?,
            available_at_ms: row.get(13)?,
            created_at_ms: row.get(14)?,
            updated_at_ms: row.get(15)?,
            started_at_ms: row.get(16)?,
            finished_at_ms: row.get(17)?,
        })
    }

    fn decode(self) -> Result<Run> {
        Ok(Run {
            id: parse_uuid(&self.id)?,
            agent_key: self.agent_key,
            conversation_id: self.conversation_id.as_deref().map(parse_uuid).transpose()?,
            input: serde_json::from_str(&self.input)?,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            error: self
                .error
                .as_deref()
                .map(serde_json::from_str::<RunError>)
                .transpose()?,
            status: self.status.parse()?,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            lease_owner: self.lease_owner,
            lease_expires_at: opt_ms_to_dt(self.lease_expires_at_ms)?,
            idempotency_key: self.idempotency_key,
            cancel_requested_at: opt_ms_to_dt(self.cancel_requested_at_ms)?,
            available_at: ms_to_dt(self.available_at_ms)?,
            created_at: ms_to_dt(self.created_at_ms)?,
            updated_at: ms_to_dt(self.updated_at_ms)?,
            started_at: opt_ms_to_dt(self.started_at_ms)?,
            finished_at: opt_ms_to_dt(self.finished_at_ms)?,
        })
    }
}

fn load_run(conn: &Connection, run_id: Uuid) -> Result<Option<Run>> {
    let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
    conn.query_row(&sql, params![run_id.to_string()], RawRun::from_row)
        .optional()?
        .map(RawRun::decode)
        .transpose()
}

fn require_run(conn: &Connection, run_id: Uuid) -> Result<Run> {
    load_run(conn, run_id)?.ok_or(RuntimeError::RunNotFound(run_id))
}

fn insert_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            RUN_COLUMNS
        ),
        params![
            run.id.to_string(),
            run.agent_key,
            run.conversation_id.map(|id| id.to_string()),
            serde_json::to_string(&run.input)?,
            run.output.as_ref().map(serde_json::to_string).transpose()?,
            run.error.as_ref().map(serde_json::to_string).transpose()?,
            run.status.as_str(),
            run.attempt,
            run.max_attempts,
            run.lease_owner,
            run.lease_expires_at.map(dt_to_ms),
            run.idempotency_key,
            run.cancel_requested_at.map(dt_to_ms),
            dt_to_ms(run.available_at),
            dt_to_ms(run.created_at),
            dt_to_ms(run.updated_at),
            run.started_at.map(dt_to_ms),
            run.finished_at.map(dt_to_ms),
        ],
    )?;
    Ok(())
}

/// Write back every column a transition may touch.
fn update_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        "UPDATE runs SET output = ?2, error = ?3, status = ?4, attempt = ?5, lease_owner = ?6,
             lease_expires_at_ms = ?7, cancel_requested_at_ms = ?8, available_at_ms = ?9,
             updated_at_ms = ?10, started_at_ms = ?11, finished_at_ms = ?12
         WHERE id = ?1",
        params![
            run.id.to_string(),
            run.output.as_ref().map(serde_json::to_string).transpose()?,
            run.error.as_ref().map(serde_json::to_string).transpose()?,
            run.status.as_str(),
            run.attempt,
            run.lease_owner,
            run.lease_expires_at.map(dt_to_ms),
            run.cancel_requested_at.map(dt_to_ms),
            dt_to_ms(run.available_at),
            dt_to_ms(run.updated_at),
            run.started_at.map(dt_to_ms),
            run.finished_at.map(dt_to_ms),
        ],
    )?;
    Ok(())
}

fn insert_event(
    conn: &Connection,
    run_id: Uuid,
    event_type: EventType,
    payload: Value,
    now: DateTime<Utc>,
) -> Result<Event> {
    let last: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1",
        params![run_id.to_string()],
        |row| row.get(0),
    )?;
    let event = Event {
        run_id,
        seq: last as u64 + 1,
        event_type,
        payload,
        created_at: now,
    };
    conn.execute(
        "INSERT INTO events (run_id, seq, event_type, payload, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run_id.to_string(),
            event.seq as i64,
            event_type.as_str(),
            serde_json::to_string(&event.payload)?,
            dt_to_ms(now),
        ],
    )?;
    Ok(event)
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_run(&self, new: NewRun) -> Result<Run> {
        self.with_conn(move |conn| {
            let tx = immediate(conn)?;
            if let Some(key) = &new.idempotency_key {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM runs WHERE idempotency_key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    return require_run(&tx, parse_uuid(&id)?);
                }
            }
            if let Some(conversation_id) = new.conversation_id {
                let found: Option<String> = tx
                    .query_row(
                        "SELECT id FROM conversations WHERE id = ?1",
                        params![conversation_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if found.is_none() {
                    return Err(RuntimeError::ConversationNotFound(conversation_id));
                }
            }

            let run = Run::new(new);
            insert_run(&tx, &run)?;
            let stored = require_run(&tx, run.id)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        self.with_conn(move |conn| load_run(conn, run_id)).await
    }

    async fn list_runs(&self, conversation_id: Option<Uuid>) -> Result<Vec<Run>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM runs WHERE (?1 IS NULL OR conversation_id = ?1) ORDER BY ordinal",
                RUN_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let raws = stmt
                .query_map(params![conversation_id.map(|id| id.to_string())], RawRun::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(RawRun::decode).collect()
        })
        .await
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, agent_key, title, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                params![
                    conversation.id.to_string(),
                    conversation.agent_key,
                    conversation.title,
                    dt_to_ms(conversation.created_at),
                ],
            )?;
            load_conversation(conn, conversation.id)?
                .ok_or(RuntimeError::ConversationNotFound(conversation.id))
        })
        .await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| load_conversation(conn, conversation_id))
            .await
    }

    async fn try_claim_next(
        &self,
        agent_keys: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Run>> {
        let agent_keys = agent_keys.to_vec();
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = immediate(conn)?;

            let mut sql = format!(
                "SELECT {} FROM runs WHERE status = 'queued' AND available_at_ms <= ?1",
                RUN_COLUMNS
            );
            if !agent_keys.is_empty() {
                let placeholders: Vec<String> =
                    (0..agent_keys.len()).map(|i| format!("?{}", i + 2)).collect();
                sql.push_str(&format!(" AND agent_key IN ({})", placeholders.join(", ")));
            }
            sql.push_str(" ORDER BY ordinal LIMIT 1");

            let mut bind: Vec<rusqlite::types::Value> = vec![dt_to_ms(now).into()];
            bind.extend(agent_keys.iter().map(|k| k.clone().into()));

            let raw = tx
                .query_row(&sql, params_from_iter(bind), RawRun::from_row)
                .optional()?;
            let Some(raw) = raw else {
                return Ok(None);
            };

            let mut run = raw.decode()?;
            apply_claim(&mut run, &worker_id, lease_ttl, now)?;
            update_run(&tx, &run)?;
            tx.commit()?;
            Ok(Some(run))
        })
        .await
    }

    async fn renew_lease(&self, lease: &Lease, lease_ttl: Duration) -> Result<Renewal> {
        let lease = lease.clone();
        self.with_conn(move |conn| {
            let now = now_ms();
            let expires_at = now + ttl_delta(lease_ttl)?;
            let changed = conn.execute(
                "UPDATE runs SET lease_expires_at_ms = ?4, updated_at_ms = ?5
                 WHERE id = ?1 AND status = 'running' AND lease_owner = ?2 AND attempt = ?3",
                params![
                    lease.run_id.to_string(),
                    lease.worker_id,
                    lease.attempt,
                    dt_to_ms(expires_at),
                    dt_to_ms(now),
                ],
            )?;
            if changed == 0 {
                return Ok(Renewal::Lost);
            }
            let cancel_requested: Option<i64> = conn.query_row(
                "SELECT cancel_requested_at_ms FROM runs WHERE id = ?1",
                params![lease.run_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(Renewal::Renewed {
                expires_at,
                cancel_requested: cancel_requested.is_some(),
            })
        })
        .await
    }

    async fn finalize(&self, lease: &Lease, outcome: Outcome) -> Result<Finalized> {
        let lease = lease.clone();
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = immediate(conn)?;
            let mut run = require_run(&tx, lease.run_id)?;
            let (transition, terminal) = apply_outcome(&mut run, &lease, outcome, now)?;
            update_run(&tx, &run)?;

            let finalized = match (terminal, transition.terminal_event()) {
                (Some(payload), Some(event_type)) => {
                    let event = insert_event(&tx, run.id, event_type, payload, now)?;
                    Finalized::Terminal { run, event }
                }
                _ => Finalized::Requeued { run },
            };
            tx.commit()?;
            Ok(finalized)
        })
        .await
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<CancelOutcome> {
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = immediate(conn)?;
            let mut run = require_run(&tx, run_id)?;

            let status = run.status;
            let outcome = match status {
                status if status.is_terminal() => CancelOutcome::AlreadyTerminal(run),
                RunStatus::Queued => {
                    let (transition, payload) = apply_queued_cancel(&mut run, now)?;
                    update_run(&tx, &run)?;
                    let event_type = transition.terminal_event().unwrap_or(EventType::RunCancelled);
                    let event = insert_event(&tx, run_id, event_type, payload.unwrap_or_default(), now)?;
                    CancelOutcome::Cancelled { run, event }
                }
                _ => {
                    run.cancel_requested_at.get_or_insert(now);
                    run.updated_at = now;
                    update_run(&tx, &run)?;
                    CancelOutcome::Requested(run)
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn reclaim_expired_leases(&self) -> Result<Vec<Reclaimed>> {
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = immediate(conn)?;

            let raws = {
                let sql = format!(
                    "SELECT {} FROM runs WHERE status = 'running' AND lease_expires_at_ms <= ?1 ORDER BY ordinal",
                    RUN_COLUMNS
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params![dt_to_ms(now)], RawRun::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut reclaimed = Vec::with_capacity(raws.len());
            for raw in raws {
                let mut run = raw.decode()?;
                let (transition, terminal) = apply_reclaim(&mut run, now)?;
                update_run(&tx, &run)?;
                match (terminal, transition.terminal_event()) {
                    (Some(payload), Some(event_type)) => {
                        let event = insert_event(&tx, run.id, event_type, payload, now)?;
                        reclaimed.push(Reclaimed::Terminal { run, event });
                    }
                    _ => reclaimed.push(Reclaimed::Requeued {
                        run_id: run.id,
                        attempt: run.attempt,
                    }),
                }
            }
            tx.commit()?;
            Ok(reclaimed)
        })
        .await
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
        fence: Option<&Lease>,
    ) -> Result<Event> {
        let fence = fence.cloned();
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = immediate(conn)?;
            let run = require_run(&tx, run_id)?;
            check_append(&run, event_type, fence.as_ref())?;
            let event = insert_event(&tx, run_id, event_type, payload, now)?;
            tx.commit()?;
            Ok(event)
        })
        .await
    }

    async fn read_events(&self, run_id: Uuid, since_seq: u64) -> Result<Vec<Event>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, event_type, payload, created_at_ms FROM events
                 WHERE run_id = ?1 AND seq > ?2 ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string(), since_seq as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(seq, event_type, payload, created_at_ms)| {
                    Ok(Event {
                        run_id,
                        seq: seq as u64,
                        event_type: event_type.parse()?,
                        payload: serde_json::from_str(&payload)?,
                        created_at: ms_to_dt(created_at_ms)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn save_checkpoint(&self, lease: &Lease, state: Value) -> Result<Checkpoint> {
        let lease = lease.clone();
        self.with_conn(move |conn| {
            let now = now_ms();
            let tx = immediate(conn)?;
            let run = require_run(&tx, lease.run_id)?;
            if !run.is_held_by(&lease.worker_id, lease.attempt) {
                return Err(RuntimeError::LeaseLost(lease.run_id));
            }
            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM checkpoints WHERE run_id = ?1",
                params![lease.run_id.to_string()],
                |row| row.get(0),
            )?;
            let checkpoint = Checkpoint {
                run_id: lease.run_id,
                seq: last as u64 + 1,
                state,
                created_at: now,
            };
            tx.execute(
                "INSERT INTO checkpoints (run_id, seq, state, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
                params![
                    lease.run_id.to_string(),
                    checkpoint.seq as i64,
                    serde_json::to_string(&checkpoint.state)?,
                    dt_to_ms(now),
                ],
            )?;
            tx.commit()?;
            Ok(checkpoint)
        })
        .await
    }

    async fn latest_checkpoint(&self, run_id: Uuid) -> Result<Option<Checkpoint>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT seq, state, created_at_ms FROM checkpoints
                     WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![run_id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(seq, state, created_at_ms)| {
                Ok(Checkpoint {
                    run_id,
                    seq: seq as u64,
                    state: serde_json::from_str(&state)?,
                    created_at: ms_to_dt(created_at_ms)?,
                })
            })
            .transpose()
        })
        .await
    }
}

fn load_conversation(conn: &Connection, conversation_id: Uuid) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT agent_key, title, created_at_ms FROM conversations WHERE id = ?1",
            params![conversation_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()?;
    row.map(|(agent_key, title, created_at_ms)| {
        Ok(Conversation {
            id: conversation_id,
            agent_key,
            title,
            created_at: ms_to_dt(created_at_ms)?,
        })
    })
    .transpose()
}
