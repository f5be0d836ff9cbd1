//! Debounced write coalescing.
//!
//! One slot per (table, id, field). Each `schedule` replaces the slot's value
//! and restarts its idle timer; when the timer runs out the flush function is
//! called once with the last value. Intermediate values are never sent.
//!
//! ```text
//! schedule ──► slot task ──(idle window)──► flush(last value)
//!                 ▲    │
//!    edits queue ─┘    └── retires when nothing is queued
//! ```
//!
//! # Ordering
//!
//! A slot is a single task that awaits its own flush. Anything scheduled while
//! a flush is in flight waits in the slot's channel, so writes to one field
//! never race. Slots remove themselves from the map once idle; the map lock
//! makes "nothing queued, retire" atomic with respect to `schedule`.
//!
//! # Bases
//!
//! A slot may carry the field's value from before its burst, recorded by
//! [`WriteCoalescer::schedule_from`] and taken back when the write goes out.
//! A base lives no longer than its slot: cancelling or retiring the slot
//! drops it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use roadmap_types::{RowId, Table};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

/// Address of one coalesced field.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FieldKey {
    pub table: Table,
    pub id: RowId,
    pub field: String,
}

impl FieldKey {
    pub fn new(table: Table, id: RowId, field: impl Into<String>) -> Self {
        Self { table, id, field: field.into() }
    }
}

impl std::fmt::Display for FieldKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}.{}", self.table, self.id.short(), self.field)
    }
}

/// Performs the write for a flushed value.
pub type FlushFn = Box<dyn FnOnce(Value) -> BoxFuture<'static, ()> + Send>;

enum SlotMsg {
    Edit { value: Value, flush: FlushFn },
    FlushNow,
    Cancel,
}

struct SlotHandle {
    tx: mpsc::UnboundedSender<SlotMsg>,
    /// Last scheduled value; stays visible while its flush is in flight.
    latest: Value,
}

struct Inner {
    slots: Mutex<HashMap<FieldKey, SlotHandle>>,
    /// Pre-burst values. Locked after `slots` when both are held.
    bases: Mutex<HashMap<FieldKey, Option<Value>>>,
    /// Signalled whenever the last slot retires.
    idle: Notify,
    window: Duration,
}

/// Per-field debounce arena.
#[derive(Clone)]
pub struct WriteCoalescer {
    inner: Arc<Inner>,
}

impl WriteCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                bases: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                window,
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Schedule `value` for `key`, replacing whatever was pending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, key: FieldKey, value: Value, flush: FlushFn) {
        self.schedule_inner(key, value, None, flush);
    }

    /// Like [`schedule`](Self::schedule), also recording `base` as the value
    /// the field had before this burst.
    ///
    /// The first base of a burst wins; once the burst's write has taken its
    /// base, the next edit starts a new one.
    pub fn schedule_from(&self, key: FieldKey, base: Option<Value>, value: Value, flush: FlushFn) {
        self.schedule_inner(key, value, Some(base), flush);
    }

    fn schedule_inner(&self, key: FieldKey, value: Value, base: Option<Option<Value>>, flush: FlushFn) {
        let mut slots = self.inner.slots.lock();
        let mut msg = SlotMsg::Edit { value: value.clone(), flush };
        if let Some(slot) = slots.get_mut(&key) {
            match slot.tx.send(msg) {
                Ok(()) => {
                    trace!(%key, "debounce reset");
                    slot.latest = value;
                    if let Some(base) = base {
                        self.inner.bases.lock().entry(key).or_insert(base);
                    }
                    return;
                }
                // Task already gone; start a fresh one with the same edit.
                Err(mpsc::error::SendError(returned)) => msg = returned,
            }
        }
        if let Some(base) = base {
            self.inner.bases.lock().insert(key.clone(), base);
        }
        self.spawn_slot(&mut slots, key, value, msg);
    }

    fn spawn_slot(
        &self,
        slots: &mut HashMap<FieldKey, SlotHandle>,
        key: FieldKey,
        latest: Value,
        first: SlotMsg,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: we hold the receiver.
        let _ = tx.send(first);
        trace!(%key, "debounce slot opened");
        slots.insert(key.clone(), SlotHandle { tx, latest });
        tokio::spawn(run_slot(Arc::clone(&self.inner), key, rx));
    }

    /// Fire `key`'s pending write now instead of waiting out the window.
    pub fn flush(&self, key: &FieldKey) {
        if let Some(slot) = self.inner.slots.lock().get(key) {
            let _ = slot.tx.send(SlotMsg::FlushNow);
        }
    }

    /// Take the recorded base of `key`'s burst, if any.
    pub fn take_base(&self, key: &FieldKey) -> Option<Value> {
        self.inner.bases.lock().remove(key).flatten()
    }

    /// Whether a base is recorded for `key`.
    pub fn has_base(&self, key: &FieldKey) -> bool {
        self.inner.bases.lock().contains_key(key)
    }

    /// Drop pending writes and bases for every field of `id`. In-flight
    /// writes finish.
    pub fn cancel_entity(&self, id: RowId) -> usize {
        let slots = self.inner.slots.lock();
        self.inner.bases.lock().retain(|key, _| key.id != id);
        let mut cancelled = 0;
        for (key, slot) in slots.iter().filter(|(k, _)| k.id == id) {
            if slot.tx.send(SlotMsg::Cancel).is_ok() {
                debug!(%key, "pending write cancelled");
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Whether `key` has a scheduled or in-flight write.
    pub fn is_pending(&self, key: &FieldKey) -> bool {
        self.inner.slots.lock().contains_key(key)
    }

    /// Last value scheduled for `key`, while its write is pending.
    pub fn pending_value(&self, key: &FieldKey) -> Option<Value> {
        self.inner.slots.lock().get(key).map(|s| s.latest.clone())
    }

    /// All pending (field, value) pairs of one row.
    pub fn pending_for(&self, table: Table, id: RowId) -> Vec<(String, Value)> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter(|(k, _)| k.table == table && k.id == id)
            .map(|(k, s)| (k.field.clone(), s.latest.clone()))
            .collect()
    }

    /// Every pending field with its last scheduled value.
    pub fn pending_all(&self) -> Vec<(FieldKey, Value)> {
        self.inner
            .slots
            .lock()
            .iter()
            .map(|(k, s)| (k.clone(), s.latest.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Flush every pending write and wait until all slots have retired.
    pub async fn drain(&self) {
        {
            let slots = self.inner.slots.lock();
            debug!(pending = slots.len(), "draining write coalescer");
            for slot in slots.values() {
                let _ = slot.tx.send(SlotMsg::FlushNow);
            }
        }
        loop {
            // Registered before the check so a retirement in between is seen.
            let notified = self.inner.idle.notified();
            if self.inner.slots.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WriteCoalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoalescer")
            .field("window", &self.inner.window)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Inner {
    /// Next queued message, or retire the slot if there is none.
    fn next_or_retire(&self, key: &FieldKey, rx: &mut mpsc::UnboundedReceiver<SlotMsg>) -> Option<SlotMsg> {
        let mut slots = self.slots.lock();
        match rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(_) => {
                slots.remove(key);
                self.bases.lock().remove(key);
                trace!(%key, "debounce slot retired");
                if slots.is_empty() {
                    self.idle.notify_waiters();
                }
                None
            }
        }
    }
}

async fn run_slot(inner: Arc<Inner>, key: FieldKey, mut rx: mpsc::UnboundedReceiver<SlotMsg>) {
    let mut pending: Option<(Value, FlushFn)> = None;
    loop {
        let Some((value, flush)) = pending.take() else {
            match inner.next_or_retire(&key, &mut rx) {
                Some(SlotMsg::Edit { value, flush }) => pending = Some((value, flush)),
                Some(SlotMsg::FlushNow | SlotMsg::Cancel) => {}
                None => return,
            }
            continue;
        };

        tokio::select! {
            msg = rx.recv() => match msg {
                Some(SlotMsg::Edit { value, flush }) => {
                    // Superseded value is dropped with its flush fn.
                    pending = Some((value, flush));
                }
                Some(SlotMsg::FlushNow) | None => {
                    debug!(%key, "flushing pending write early");
                    flush(value).await;
                }
                Some(SlotMsg::Cancel) => {}
            },
            _ = tokio::time::sleep(inner.window) => {
                debug!(%key, "debounce window elapsed, flushing");
                flush(value).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Log = Arc<Mutex<Vec<Value>>>;

    fn recorder(log: &Log) -> FlushFn {
        let log = Arc::clone(log);
        Box::new(move |value| {
            Box::pin(async move {
                log.lock().push(value);
            })
        })
    }

    fn slow_recorder(log: &Log, delay: Duration) -> FlushFn {
        let log = Arc::clone(log);
        Box::new(move |value| {
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                log.lock().push(value);
            })
        })
    }

    fn key(field: &str) -> FieldKey {
        FieldKey::new(Table::Tasks, RowId::nil(), field)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_value() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        for text in ["a", "ab", "abc"] {
            coalescer.schedule(key("name"), json!(text), recorder(&log));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(log.lock().is_empty());

        coalescer.drain().await;
        assert_eq!(*log.lock(), vec![json!("abc")]);
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_idle_window() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        coalescer.schedule(key("name"), json!("x"), recorder(&log));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(log.lock().is_empty());
        assert!(coalescer.is_pending(&key("name")));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock(), vec![json!("x")]);
        assert!(!coalescer.is_pending(&key("name")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fields_are_independent() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        coalescer.schedule(key("name"), json!("n"), recorder(&log));
        coalescer.schedule(key("status"), json!("done"), recorder(&log));
        assert_eq!(coalescer.pending_for(Table::Tasks, RowId::nil()).len(), 2);

        coalescer.drain().await;
        let mut written = log.lock().clone();
        written.sort_by_key(|v| v.to_string());
        assert_eq!(written, vec![json!("done"), json!("n")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_during_flight_queues_behind() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(100));
        let log: Log = Arc::default();
        coalescer.schedule(key("name"), json!("first"), slow_recorder(&log, Duration::from_millis(300)));

        // Window elapsed, flush in flight.
        tokio::time::sleep(Duration::from_millis(150)).await;
        coalescer.schedule(key("name"), json!("second"), recorder(&log));
        assert_eq!(coalescer.pending_value(&key("name")), Some(json!("second")));

        coalescer.drain().await;
        assert_eq!(*log.lock(), vec![json!("first"), json!("second")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_skips_window() {
        let coalescer = WriteCoalescer::new(Duration::from_secs(60));
        let log: Log = Arc::default();
        coalescer.schedule(key("name"), json!("now"), recorder(&log));
        coalescer.flush(&key("name"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*log.lock(), vec![json!("now")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_entity_drops_pending() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        coalescer.schedule(key("name"), json!("gone"), recorder(&log));
        let other = FieldKey::new(Table::Tasks, RowId::new(), "name");
        coalescer.schedule(other.clone(), json!("kept"), recorder(&log));

        assert_eq!(coalescer.cancel_entity(RowId::nil()), 1);
        coalescer.drain().await;
        assert_eq!(*log.lock(), vec![json!("kept")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_base_of_burst_wins() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        coalescer.schedule_from(key("name"), Some(json!("orig")), json!("a"), recorder(&log));
        coalescer.schedule_from(key("name"), Some(json!("a")), json!("ab"), recorder(&log));

        assert_eq!(coalescer.take_base(&key("name")), Some(json!("orig")));
        assert!(!coalescer.has_base(&key("name")));
        coalescer.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_entity_drops_bases() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        coalescer.schedule_from(key("name"), Some(json!("orig")), json!("gone"), recorder(&log));
        let other = FieldKey::new(Table::Tasks, RowId::new(), "name");
        coalescer.schedule_from(other.clone(), None, json!("kept"), recorder(&log));

        coalescer.cancel_entity(RowId::nil());
        assert!(!coalescer.has_base(&key("name")));
        assert!(coalescer.has_base(&other));

        coalescer.drain().await;
        assert!(!coalescer.has_base(&other));
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_all_spans_tables() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let log: Log = Arc::default();
        let plan = FieldKey::new(Table::ReleasePlans, RowId::new(), "goal");
        coalescer.schedule(key("name"), json!("n"), recorder(&log));
        coalescer.schedule(plan.clone(), json!("GA"), recorder(&log));

        let mut pending = coalescer.pending_all();
        pending.sort_by_key(|(k, _)| k.field.clone());
        assert_eq!(pending, vec![(plan, json!("GA")), (key("name"), json!("n"))]);
        coalescer.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_with_nothing_pending_returns() {
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        coalescer.drain().await;
        assert_eq!(coalescer.pending_count(), 0);
    }
}
