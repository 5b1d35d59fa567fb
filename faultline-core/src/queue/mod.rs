//! Bounded event queue with batched, single-flight delivery
//!
//! The queue buffers events in memory, mirrors them to an optional
//! [`StorageAdapter`], and delivers them through a [`BatchSender`] when:
//! - the buffer reaches `max_batch_size`
//! - the flush interval expires
//! - [`EventQueue::flush`] is called
//!
//! ## Delivery rules
//!
//! - At most one batch is in flight. Any flush requested while a batch is
//!   being sent waits for that send and observes its outcome.
//! - Batches are the oldest events first. A failed batch goes back to the
//!   head of the buffer, so retries never reorder events.
//! - Failures back off along `retry_delays`; once the schedule is used up
//!   the queue falls back to the normal flush interval and starts over.
//! - [`EventQueue::clear`] bumps a generation counter. A send that completes
//!   after a clear leaves the queue state alone.
//!
//! All state lives behind one mutex that is never held across an `.await`,
//! nor while the storage adapter or online checker runs. Storage writes go
//! through a single writer that always lands the newest snapshot last.
//! Synchronous calls such as [`EventQueue::enqueue`] write on the calling
//! thread; sends and timers write on Tokio's blocking pool.
//!
//! Sends and timers run as tasks on the Tokio runtime the queue was built
//! in, so events can be enqueued from any thread.

mod timer;

use std::cell::Cell;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::resolver::Settings;
use crate::storage::StorageAdapter;
use crate::transport::BatchSender;

use timer::Timer;

/// Backoff applied to consecutive delivery failures
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 3] = [1_000, 2_000, 4_000];

/// How often [`EventQueue::drain`] checks on a final batch still in flight
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Connectivity probe; `false` defers delivery
pub type OnlineCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Sizing and timing of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub retry_delays: Vec<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl QueueOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            flush_interval: settings.flush_interval(),
            max_batch_size: settings.max_batch_size,
            max_queue_size: settings.max_queue_size,
            retry_delays: DEFAULT_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// Partial update for [`EventQueue::update_options`]
#[derive(Debug, Clone, Default)]
pub struct QueueOptionsUpdate {
    pub flush_interval: Option<Duration>,
    pub max_batch_size: Option<usize>,
    pub max_queue_size: Option<usize>,
    pub retry_delays: Option<Vec<Duration>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// Set by retries and backlog draining. A send already in flight is
    /// joined either way.
    pub force: bool,
}

impl FlushOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Result of a flush, shared by every caller waiting on the same send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Empty,
    /// The online checker reported offline; events stay queued
    Offline,
    /// A batch of this many events was accepted by the sender
    Delivered(usize),
    /// The sender failed; the batch was put back and a retry scheduled
    Failed(String),
    /// The queue was cleared while the batch was in flight
    Superseded,
}

/// Result of [`EventQueue::drain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    /// Events accepted by the sender while draining, backlog batches included
    pub delivered: usize,
    /// Outcome that ended the drain
    pub last: FlushOutcome,
}

/// Delivery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Events accepted by the sender
    pub events_sent: usize,
    /// Successful sender calls
    pub batches_sent: usize,
    /// Failed sender calls
    pub send_failures: usize,
    /// Events evicted because the queue was full
    pub events_dropped: usize,
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// True while this thread runs a queue's storage adapter or online checker
///
/// Anything reported from inside those callbacks must not be captured back
/// into the queue, or every write would queue another event to write.
pub fn in_queue_callback() -> bool {
    IN_CALLBACK.try_with(Cell::get).unwrap_or(false)
}

struct CallbackScope {
    previous: bool,
}

impl CallbackScope {
    fn enter() -> Self {
        let previous = IN_CALLBACK.try_with(|flag| flag.replace(true)).unwrap_or(false);
        Self { previous }
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        let _ = IN_CALLBACK.try_with(|flag| flag.set(self.previous));
    }
}

/// Full contents to mirror into one adapter
struct Snapshot {
    storage: Arc<dyn StorageAdapter>,
    events: Vec<Event>,
}

impl Snapshot {
    fn write(&self) -> Result<()> {
        if self.events.is_empty() {
            self.storage.clear()
        } else {
            self.storage.save(&self.events)
        }
    }
}

#[derive(Default)]
struct WriterSlot {
    pending: Option<Snapshot>,
    writing: bool,
}

/// Single writer for queue snapshots
///
/// Snapshots are posted under the queue lock, so the slot always holds the
/// newest one. Whoever drains first writes until the slot is empty; a post
/// made meanwhile, from any thread or from inside the adapter itself, is
/// picked up by that writer.
#[derive(Default)]
struct SnapshotWriter {
    slot: Mutex<WriterSlot>,
}

impl SnapshotWriter {
    fn slot(&self) -> MutexGuard<'_, WriterSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, snapshot: Snapshot) {
        self.slot().pending = Some(snapshot);
    }

    fn has_pending(&self) -> bool {
        self.slot().pending.is_some()
    }

    fn drain(&self) {
        {
            let mut slot = self.slot();
            if slot.writing || slot.pending.is_none() {
                return;
            }
            slot.writing = true;
        }
        let _unwind = UnwindGuard(self);
        let _scope = CallbackScope::enter();

        loop {
            let snapshot = {
                let mut slot = self.slot();
                match slot.pending.take() {
                    Some(snapshot) => snapshot,
                    None => {
                        slot.writing = false;
                        return;
                    }
                }
            };
            if let Err(e) = snapshot.write() {
                tracing::warn!(error = %e, "Failed to persist event queue");
            }
        }
    }
}

/// Releases the writer role if the adapter panics mid-write
struct UnwindGuard<'a>(&'a SnapshotWriter);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.slot().writing = false;
        }
    }
}

enum Flight {
    Idle,
    Sending(watch::Receiver<Option<FlushOutcome>>),
}

enum FlushStart {
    Done(FlushOutcome),
    Pending(watch::Receiver<Option<FlushOutcome>>),
}

struct State {
    buffer: VecDeque<Event>,
    /// Copy of the batch handed to the sender
    in_flight: Vec<Event>,
    flight: Flight,
    retry_index: usize,
    generation: u64,
    options: QueueOptions,
    sender: Arc<dyn BatchSender>,
    storage: Option<Arc<dyn StorageAdapter>>,
    writer: Arc<SnapshotWriter>,
    online: Option<OnlineCheck>,
    runtime: Handle,
    flush_timer: Timer,
    retry_timer: Timer,
    stats: QueueStats,
}

impl State {
    /// Post in-flight and buffered events for the writer
    ///
    /// Nothing touches storage until the caller drops the lock and drains.
    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        let events = self
            .in_flight
            .iter()
            .chain(self.buffer.iter())
            .cloned()
            .collect();
        self.writer.post(Snapshot {
            storage: storage.clone(),
            events,
        });
    }

    fn batch_ready(&self) -> bool {
        matches!(self.flight, Flight::Idle) && self.buffer.len() >= self.options.max_batch_size
    }

    /// Drop the oldest events beyond `max_queue_size`
    fn enforce_capacity(&mut self) -> usize {
        let overflow = self
            .buffer
            .len()
            .saturating_sub(self.options.max_queue_size);
        if overflow > 0 {
            self.buffer.drain(..overflow);
            self.stats.events_dropped += overflow;
            tracing::debug!(
                dropped = overflow,
                max_queue_size = self.options.max_queue_size,
                "Event queue over capacity, dropped oldest events"
            );
        }
        overflow
    }
}

/// Handle to a shared event queue; clones refer to the same queue
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Mutex<State>>,
    writer: Arc<SnapshotWriter>,
}

/// Configures collaborators before the queue hydrates from storage
pub struct EventQueueBuilder {
    options: QueueOptions,
    sender: Arc<dyn BatchSender>,
    storage: Option<Arc<dyn StorageAdapter>>,
    online: Option<OnlineCheck>,
}

impl EventQueueBuilder {
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn online_checker<F>(mut self, online: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.online = Some(Arc::new(online));
        self
    }

    /// Build the queue, restoring any events left in storage
    ///
    /// Schedules a flush when restored events are present. Must be called
    /// from within a Tokio runtime; the queue keeps a handle to it.
    pub fn build(self) -> EventQueue {
        let restored = self
            .storage
            .as_ref()
            .map(load_or_empty)
            .unwrap_or_default();

        let writer = Arc::new(SnapshotWriter::default());
        let queue = EventQueue {
            writer: writer.clone(),
            inner: Arc::new(Mutex::new(State {
                buffer: restored.into(),
                in_flight: Vec::new(),
                flight: Flight::Idle,
                retry_index: 0,
                generation: 0,
                options: self.options,
                sender: self.sender,
                storage: self.storage,
                writer,
                online: self.online,
                runtime: Handle::current(),
                flush_timer: Timer::default(),
                retry_timer: Timer::default(),
                stats: QueueStats::default(),
            })),
        };

        {
            let mut state = queue.lock();
            if !state.buffer.is_empty() {
                tracing::info!(
                    restored = state.buffer.len(),
                    "Restored queued events from storage"
                );
                if state.enforce_capacity() > 0 {
                    state.persist();
                }
                queue.schedule_flush(&mut state);
            }
        }
        queue.writer.drain();

        queue
    }
}

impl EventQueue {
    pub fn builder(options: QueueOptions, sender: Arc<dyn BatchSender>) -> EventQueueBuilder {
        EventQueueBuilder {
            options,
            sender,
            storage: None,
            online: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a copy of `event` and return the stored copy
    ///
    /// Evicts the oldest event when full. Starts a send right away once a
    /// full batch is buffered and nothing is in flight, otherwise (re)arms
    /// the flush timer.
    pub fn enqueue(&self, event: &Event) -> Event {
        let stored = event.clone();

        let batch_ready = {
            let mut state = self.lock();
            if state.buffer.len() >= state.options.max_queue_size {
                state.buffer.pop_front();
                state.stats.events_dropped += 1;
                tracing::debug!(
                    max_queue_size = state.options.max_queue_size,
                    "Event queue full, dropped oldest event"
                );
            }
            state.buffer.push_back(stored.clone());
            state.persist();

            let ready = state.batch_ready();
            if !ready {
                self.schedule_flush(&mut state);
            }
            ready
        };

        if batch_ready {
            let online = self.is_online();
            let mut state = self.lock();
            // Another caller may have taken the batch while unlocked
            if state.batch_ready() {
                let _ = self.start_flush(&mut state, FlushOptions::default(), online);
            } else {
                self.schedule_flush(&mut state);
            }
        }
        self.writer.drain();

        stored
    }

    /// Deliver up to `max_batch_size` of the oldest events
    ///
    /// Never returns delivery errors; they feed the retry schedule and show
    /// up as [`FlushOutcome::Failed`].
    pub async fn flush(&self, options: FlushOptions) -> FlushOutcome {
        let online = self.is_online();
        let start = {
            let mut state = self.lock();
            self.start_flush(&mut state, options, online)
        };

        match start {
            FlushStart::Done(outcome) => {
                self.write_in_background().await;
                outcome
            }
            FlushStart::Pending(mut rx) => {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|v| v.clone());
                outcome.unwrap_or(FlushOutcome::Superseded)
            }
        }
    }

    /// Flush until nothing is queued or in flight
    ///
    /// Stops early on the first `Offline`, `Failed` or `Superseded` outcome.
    /// Batches the queue sends on its own while draining are counted too.
    pub async fn drain(&self) -> DrainSummary {
        let sent_before = self.stats().events_sent;

        let last = loop {
            match self.flush(FlushOptions::default()).await {
                FlushOutcome::Delivered(_) => {}
                FlushOutcome::Empty if self.is_sending() => {
                    tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                }
                outcome => break outcome,
            }
        };

        DrainSummary {
            delivered: self.stats().events_sent.saturating_sub(sent_before),
            last,
        }
    }

    /// Snapshot of buffered events, oldest first (excludes a batch in flight)
    pub fn buffered_events(&self) -> Vec<Event> {
        self.lock().buffer.iter().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.lock().flight, Flight::Sending(_))
    }

    /// Position in the retry schedule; 0 after any successful send
    pub fn retry_attempt(&self) -> usize {
        self.lock().retry_index
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats.clone()
    }

    pub fn options(&self) -> QueueOptions {
        self.lock().options.clone()
    }

    /// Drop every queued event and cancel pending timers
    ///
    /// A send in flight keeps running, but its completion no longer touches
    /// the queue.
    pub fn clear(&self) {
        {
            let mut state = self.lock();
            let dropped = state.buffer.len() + state.in_flight.len();

            state.buffer.clear();
            state.in_flight.clear();
            state.flush_timer.cancel();
            state.retry_timer.cancel();
            state.retry_index = 0;
            state.generation += 1;
            state.persist();

            tracing::debug!(dropped, "Cleared event queue");
        }
        self.writer.drain();
    }

    pub fn set_sender(&self, sender: Arc<dyn BatchSender>) {
        self.lock().sender = sender;
    }

    pub fn set_online_checker(&self, online: Option<OnlineCheck>) {
        self.lock().online = online;
    }

    /// Swap storage, merging its events into the buffer
    ///
    /// Stored events not already queued (by `event_id`) are placed ahead of
    /// the current buffer. The merged set is written to the new adapter.
    pub fn set_storage_adapter(&self, storage: Option<Arc<dyn StorageAdapter>>) {
        let stored = storage.as_ref().map(load_or_empty).unwrap_or_default();

        {
            let mut state = self.lock();
            state.storage = storage;

            if !stored.is_empty() {
                let known: HashSet<Uuid> = state
                    .buffer
                    .iter()
                    .chain(state.in_flight.iter())
                    .map(|e| e.event_id)
                    .collect();
                let mut merged: VecDeque<Event> = stored
                    .into_iter()
                    .filter(|e| !known.contains(&e.event_id))
                    .collect();
                merged.extend(state.buffer.drain(..));
                state.buffer = merged;
                state.enforce_capacity();
            }

            state.persist();
            if !state.buffer.is_empty() {
                self.schedule_flush(&mut state);
            }
        }
        self.writer.drain();
    }

    /// Change sizing or timing at runtime
    ///
    /// A new flush interval re-arms a pending flush timer. A smaller
    /// `max_queue_size` keeps only the most recent events. Sizes clamp to 1.
    pub fn update_options(&self, update: QueueOptionsUpdate) {
        let mut state = self.lock();

        if let Some(max_batch_size) = update.max_batch_size {
            state.options.max_batch_size = max_batch_size.max(1);
        }

        if let Some(retry_delays) = update.retry_delays {
            if state.retry_index > retry_delays.len() {
                state.retry_index = 0;
            }
            state.options.retry_delays = retry_delays;
        }

        if let Some(interval) = update.flush_interval {
            let interval = interval.max(Duration::from_millis(1));
            if interval != state.options.flush_interval {
                state.options.flush_interval = interval;
                if state.flush_timer.is_pending() {
                    self.schedule_flush(&mut state);
                }
            }
        }

        if let Some(max_queue_size) = update.max_queue_size {
            state.options.max_queue_size = max_queue_size.max(1);
            if state.enforce_capacity() > 0 {
                state.persist();
            }
        }
        drop(state);
        self.writer.drain();
    }

    /// Runs the online checker without holding the queue lock
    fn is_online(&self) -> bool {
        let Some(online) = self.lock().online.clone() else {
            return true;
        };
        let _scope = CallbackScope::enter();
        online()
    }

    /// Write pending snapshots on the blocking pool
    async fn write_in_background(&self) {
        if !self.writer.has_pending() {
            return;
        }
        let writer = self.writer.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || writer.drain()).await {
            tracing::warn!(error = %e, "Event queue writer task failed");
        }
    }

    /// `online` must come from [`Self::is_online`], called before locking
    fn start_flush(&self, state: &mut State, options: FlushOptions, online: bool) -> FlushStart {
        if state.buffer.is_empty() {
            state.flush_timer.cancel();
            state.retry_timer.cancel();
            state.persist();
            return FlushStart::Done(FlushOutcome::Empty);
        }

        if let Flight::Sending(rx) = &state.flight {
            tracing::trace!(forced = options.force, "Joining in-flight send");
            return FlushStart::Pending(rx.clone());
        }

        if !online {
            tracing::debug!(queued = state.buffer.len(), "Offline, deferring flush");
            self.schedule_flush(state);
            return FlushStart::Done(FlushOutcome::Offline);
        }

        state.flush_timer.cancel();
        state.retry_timer.cancel();

        let count = state.options.max_batch_size.min(state.buffer.len());
        state.in_flight = state.buffer.drain(..count).collect();

        let (tx, rx) = watch::channel(None);
        state.flight = Flight::Sending(rx.clone());

        let generation = state.generation;
        let batch = state.in_flight.clone();
        let sender = state.sender.clone();
        let queue = self.clone();

        state.runtime.spawn(async move {
            // Inner task so a panicking sender still completes the flight
            let send = tokio::spawn(async move { sender.send_batch(batch).await });
            let result = send
                .await
                .unwrap_or_else(|e| Err(Error::Delivery(format!("sender task failed: {e}"))));
            let (outcome, backlog) = queue.complete_flight(generation, result);
            if backlog {
                // Drain the backlog without waiting for the timer
                let online = queue.is_online();
                let mut state = queue.lock();
                let _ = queue.start_flush(&mut state, FlushOptions::forced(), online);
            }
            queue.write_in_background().await;
            let _ = tx.send(Some(outcome));
        });

        FlushStart::Pending(rx)
    }

    /// Apply a send result; the flag asks the caller to drain the backlog
    fn complete_flight(&self, generation: u64, result: Result<()>) -> (FlushOutcome, bool) {
        let mut state = self.lock();
        state.flight = Flight::Idle;

        if state.generation != generation {
            tracing::debug!("Send finished after queue was cleared, ignoring result");
            return (FlushOutcome::Superseded, false);
        }

        let batch = std::mem::take(&mut state.in_flight);

        match result {
            Ok(()) => {
                state.retry_index = 0;
                state.stats.events_sent += batch.len();
                state.stats.batches_sent += 1;
                state.persist();
                tracing::debug!(
                    sent = batch.len(),
                    remaining = state.buffer.len(),
                    "Delivered event batch"
                );

                let backlog = !state.buffer.is_empty();
                if !backlog {
                    self.schedule_flush(&mut state);
                }
                (FlushOutcome::Delivered(batch.len()), backlog)
            }
            Err(e) => {
                state.stats.send_failures += 1;
                tracing::warn!(error = %e, events = batch.len(), "Failed to deliver event batch");

                for event in batch.into_iter().rev() {
                    state.buffer.push_front(event);
                }
                state.enforce_capacity();
                state.persist();

                if state.retry_index >= state.options.retry_delays.len() {
                    state.retry_index = 0;
                    self.schedule_flush(&mut state);
                } else {
                    let delay = state.options.retry_delays[state.retry_index];
                    state.retry_index += 1;
                    tracing::debug!(
                        attempt = state.retry_index,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling delivery retry"
                    );
                    self.schedule_retry(&mut state, delay);
                }
                (FlushOutcome::Failed(e.to_string()), false)
            }
        }
    }

    fn schedule_flush(&self, state: &mut State) {
        let weak = Arc::downgrade(&self.inner);
        let interval = state.options.flush_interval;
        let runtime = state.runtime.clone();
        state
            .flush_timer
            .schedule(&runtime, interval, move || fire(weak, FlushOptions::default()));
    }

    fn schedule_retry(&self, state: &mut State, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let runtime = state.runtime.clone();
        state
            .retry_timer
            .schedule(&runtime, delay, move || fire(weak, FlushOptions::forced()));
    }
}

/// Timer callback; a dropped queue makes it a no-op
fn fire(weak: Weak<Mutex<State>>, options: FlushOptions) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let writer = inner
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .writer
        .clone();
    let queue = EventQueue { inner, writer };

    let online = queue.is_online();
    {
        let mut state = queue.lock();
        let _ = queue.start_flush(&mut state, options, online);
    }
    if queue.writer.has_pending() {
        let writer = queue.writer.clone();
        tokio::task::spawn_blocking(move || writer.drain());
    }
}

fn load_or_empty(storage: &Arc<dyn StorageAdapter>) -> Vec<Event> {
    let _scope = CallbackScope::enter();
    match storage.load() {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load queued events, starting empty");
            Vec::new()
        }
    }
}
