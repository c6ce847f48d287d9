use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::config::{EventBusBackend, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventType};
use crate::store::{Lease, Store};

/// Live events buffered per run before a slow subscriber is marked lagged.
const LIVE_CAPACITY: usize = 256;
/// Events buffered between a subscription task and its consumer.
const STREAM_BUFFER: usize = 64;

pub type EventStream = Pin<Box<dyn tokio_stream::Stream<Item = Result<Event>> + Send>>;

type Channels = Arc<Mutex<HashMap<Uuid, broadcast::Sender<Event>>>>;

/// Per-run ordered event log with replay-then-live subscriptions.
///
/// Appends go to the store first; only persisted events are fanned out. Subscribers
/// are independent: each gets every event of the run exactly once, in `seq` order,
/// ending with the terminal event.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn Store>,
    backend: EventBusBackend,
    poll_interval: Duration,
    channels: Channels,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("backend", &self.backend)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(store: Arc<dyn Store>, backend: EventBusBackend, poll_interval: Duration) -> Self {
        Self {
            store,
            backend,
            poll_interval,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(store: Arc<dyn Store>, config: &RuntimeConfig) -> Self {
        Self::new(store, config.event_bus_backend, config.event_poll_interval)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Persist a non-terminal event under `lease` and fan it out.
    pub async fn emit(&self, lease: &Lease, event_type: EventType, payload: Value) -> Result<Event> {
        let event = self
            .store
            .append_event(lease.run_id, event_type, payload, Some(lease))
            .await?;
        self.announce(&event);
        Ok(event)
    }

    /// Fan out an event the store has already persisted.
    ///
    /// Terminal events also retire the run's live channel; receivers drain what was
    /// sent and then observe the close.
    pub fn announce(&self, event: &Event) {
        let Ok(mut channels) = self.channels.lock() else {
            tracing::warn!(run_id = %event.run_id, "Event channel registry poisoned");
            return;
        };
        if let Some(sender) = channels.get(&event.run_id) {
            let delivered = sender.send(event.clone()).unwrap_or(0);
            tracing::debug!(run_id = %event.run_id, seq = event.seq, event_type = %event.event_type, delivered, "Event announced");
        }
        if event.is_terminal() {
            channels.remove(&event.run_id);
        }
    }

    /// Persisted events with `seq > since_seq`.
    pub async fn replay(&self, run_id: Uuid, since_seq: u64) -> Result<Vec<Event>> {
        self.store.read_events(run_id, since_seq).await
    }

    /// Stream the run's events after `since_seq`: persisted ones first, then live ones.
    ///
    /// The stream ends after the terminal event, or immediately after replay when the
    /// run already finished and the cursor is past its terminal event.
    pub async fn subscribe(&self, run_id: Uuid, since_seq: u64) -> Result<EventStream> {
        if self.store.get_run(run_id).await?.is_none() {
            return Err(RuntimeError::RunNotFound(run_id));
        }

        // Register for live events before reading the store so nothing falls between.
        let live = self.live_receiver(run_id)?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let bus = self.clone();

        tokio::spawn(async move {
            let mut subscription = Subscription {
                bus: bus.clone(),
                run_id,
                last_seq: since_seq,
                live,
                tx,
            };
            if let Err(e) = subscription.run().await {
                tracing::warn!(run_id = %run_id, error = %e, "Event subscription failed");
                let _ = subscription.tx.send(Err(e)).await;
            }
            drop(subscription);
            bus.release(run_id);
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn live_receiver(&self, run_id: Uuid) -> Result<broadcast::Receiver<Event>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| RuntimeError::Internal("event channel registry poisoned".into()))?;
        Ok(channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(LIVE_CAPACITY).0)
            .subscribe())
    }

    /// Drop a run's channel once nobody listens to it.
    fn release(&self, run_id: Uuid) {
        if let Ok(mut channels) = self.channels.lock() {
            if channels
                .get(&run_id)
                .is_some_and(|sender| sender.receiver_count() == 0)
            {
                channels.remove(&run_id);
            }
        }
    }
}

enum Step {
    Live(Event),
    CatchUp,
    Reattach,
    Stop,
}

/// State of one subscriber's delivery task.
struct Subscription {
    bus: EventBus,
    run_id: Uuid,
    last_seq: u64,
    live: broadcast::Receiver<Event>,
    tx: mpsc::Sender<Result<Event>>,
}

impl Subscription {
    async fn run(&mut self) -> Result<()> {
        if self.settle().await? {
            return Ok(());
        }

        loop {
            match self.next_step().await {
                Step::Stop => return Ok(()),
                Step::Live(event) if event.seq <= self.last_seq => {}
                Step::Live(event) if event.seq == self.last_seq + 1 => {
                    if self.deliver(event).await? {
                        return Ok(());
                    }
                }
                // gap, lag or poll tick: the store is authoritative
                Step::Live(_) | Step::CatchUp => {
                    if self.settle().await? {
                        return Ok(());
                    }
                }
                Step::Reattach => {
                    self.live = self.bus.live_receiver(self.run_id)?;
                    if self.settle().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn next_step(&mut self) -> Step {
        let backend = self.bus.backend;
        let poll_interval = self.bus.poll_interval;
        let poll = async move {
            match backend {
                EventBusBackend::Polling => tokio::time::sleep(poll_interval).await,
                EventBusBackend::Local => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = self.live.recv() => match received {
                Ok(event) => Step::Live(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(run_id = %self.run_id, skipped, "Subscriber lagged, re-reading store");
                    Step::CatchUp
                }
                Err(broadcast::error::RecvError::Closed) => Step::Reattach,
            },
            _ = poll => Step::CatchUp,
            _ = self.tx.closed() => Step::Stop,
        }
    }

    /// Deliver everything persisted after the cursor. Returns true once the terminal
    /// event went out.
    async fn catch_up(&mut self) -> Result<bool> {
        let events = self.bus.replay(self.run_id, self.last_seq).await?;
        for event in events {
            if event.seq != self.last_seq + 1 {
                return Err(RuntimeError::Store(format!(
                    "event log for run {} skips from seq {} to {}",
                    self.run_id, self.last_seq, event.seq
                )));
            }
            if self.deliver(event).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Catch up, then stop if the run has finished.
    ///
    /// The terminal event is persisted together with the terminal status, so one more
    /// read after seeing the status picks it up if it landed after the first read. A
    /// cursor already past the terminal event ends the stream with nothing delivered.
    async fn settle(&mut self) -> Result<bool> {
        if self.catch_up().await? {
            return Ok(true);
        }
        let run = self
            .bus
            .store
            .get_run(self.run_id)
            .await?
            .ok_or(RuntimeError::RunNotFound(self.run_id))?;
        if run.is_terminal() {
            self.catch_up().await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn deliver(&mut self, event: Event) -> Result<bool> {
        let terminal = event.is_terminal();
        self.last_seq = event.seq;
        if self.tx.send(Ok(event)).await.is_err() {
            // consumer went away
            return Ok(true);
        }
        Ok(terminal)
    }
}
