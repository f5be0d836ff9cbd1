//! In-memory backing store and presence hub.
//!
//! Used for tests and offline demos. All data is ephemeral. The store
//! behaves like the hosted database the engine normally talks to: it assigns
//! ids, broadcasts a change event per committed row in commit order, and
//! cascades deletes to child rows. Fault injection makes write failures
//! reproducible.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use roadmap_types::{ChangeEvent, Row, RowExt, RowId, SessionId, Table};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::constants::DEFAULT_EVENT_BUFFER;
use crate::error::StoreError;
use crate::presence::{PresenceEvent, PresenceMember};
use crate::store::{BackingStore, Filter, PresenceTransport};

/// Kind of a recorded write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

/// One write the store accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub table: Table,
    pub id: RowId,
    pub fields: Row,
}

#[derive(Default)]
struct Faults {
    fail_next_writes: usize,
    fail_next_reads: usize,
    fail_ids: HashSet<RowId>,
}

/// Ephemeral [`BackingStore`].
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, IndexMap<RowId, Row>>>,
    channels: HashMap<Table, broadcast::Sender<ChangeEvent>>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<WriteRecord>>,
    transactional: bool,
    latency: Option<Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let channels = Table::ALL
            .iter()
            .map(|t| (*t, broadcast::channel(DEFAULT_EVENT_BUFFER).0))
            .collect();
        Self {
            tables: RwLock::new(HashMap::new()),
            channels,
            faults: Mutex::new(Faults::default()),
            log: Mutex::new(Vec::new()),
            transactional: false,
            latency: None,
        }
    }

    /// Advertise and honor all-or-nothing `write_batch`.
    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    /// Delay every operation, to keep writes in flight for a while.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    // ========================================================================
    // Test helpers
    // ========================================================================

    /// Insert a row without emitting an event. Assigns an id if missing.
    pub fn seed(&self, table: Table, mut row: Row) -> RowId {
        let id = row.id().unwrap_or_else(RowId::new);
        row.insert("id".into(), id.to_json());
        self.tables.write().entry(table).or_default().insert(id, row);
        id
    }

    pub fn row(&self, table: Table, id: RowId) -> Option<Row> {
        self.tables.read().get(&table).and_then(|t| t.get(&id).cloned())
    }

    pub fn rows(&self, table: Table) -> Vec<Row> {
        self.tables
            .read()
            .get(&table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Broadcast a raw event without touching storage.
    ///
    /// For replaying duplicates and partial payloads.
    pub fn emit(&self, event: ChangeEvent) {
        if let Some(tx) = self.channels.get(&event.table) {
            let _ = tx.send(event);
        }
    }

    /// Fail the next `n` writes with a network error.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults.lock().fail_next_writes = n;
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.faults.lock().fail_next_reads = n;
    }

    /// Reject every write touching `id` until cleared.
    pub fn fail_writes_to(&self, id: RowId) {
        self.faults.lock().fail_ids.insert(id);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Every accepted write, in order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.log.lock().clone()
    }

    /// Accepted updates of one row.
    pub fn writes_to(&self, table: Table, id: RowId) -> Vec<Row> {
        self.log
            .lock()
            .iter()
            .filter(|w| w.op == WriteOp::Update && w.table == table && w.id == id)
            .map(|w| w.fields.clone())
            .collect()
    }

    pub fn clear_writes(&self) {
        self.log.lock().clear();
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_write(&self, id: Option<RowId>) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        if faults.fail_next_writes > 0 {
            faults.fail_next_writes -= 1;
            return Err(StoreError::Network("injected write failure".into()));
        }
        match id {
            Some(id) if faults.fail_ids.contains(&id) => {
                Err(StoreError::Rejected(format!("injected rejection for {id}")))
            }
            _ => Ok(()),
        }
    }

    fn send(&self, event: ChangeEvent) {
        if let Some(tx) = self.channels.get(&event.table) {
            trace!(table = %event.table, kind = %event.kind, "change event");
            let _ = tx.send(event);
        }
    }

    fn record(&self, op: WriteOp, table: Table, id: RowId, fields: Row) {
        self.log.lock().push(WriteRecord { op, table, id, fields });
    }

    /// Merge `fields` into a stored row and emit the UPDATE. Caller holds the lock.
    fn apply_update(
        &self,
        tables: &mut HashMap<Table, IndexMap<RowId, Row>>,
        table: Table,
        id: RowId,
        fields: &Row,
    ) -> Result<(), StoreError> {
        let row = tables
            .get_mut(&table)
            .and_then(|t| t.get_mut(&id))
            .ok_or(StoreError::NotFound { table, id })?;
        let old = row.clone();
        row.merge_from(fields);
        row.insert("id".into(), id.to_json());
        let new = row.clone();
        self.send(ChangeEvent::update(table, new, Some(old)));
        Ok(())
    }

    /// Delete a row and everything that hangs off it. Caller holds the lock.
    fn delete_cascade(&self, tables: &mut HashMap<Table, IndexMap<RowId, Row>>, table: Table, id: RowId) {
        let Some(old) = tables.get_mut(&table).and_then(|t| t.shift_remove(&id)) else {
            return;
        };
        self.send(ChangeEvent::delete(table, old));

        for child in Table::ALL.iter().copied().filter(|c| c.parent_table() == Some(table)) {
            let Some(field) = child.parent_field() else {
                continue;
            };
            let children: Vec<RowId> = tables
                .get(&child)
                .map(|rows| {
                    rows.iter()
                        .filter(|(_, r)| r.ref_id(field) == Some(id))
                        .map(|(cid, _)| *cid)
                        .collect()
                })
                .unwrap_or_default();
            for child_id in children {
                if child == Table::Epics {
                    // Epics survive their release plan and drop into the backlog.
                    let mut orphan = Row::new();
                    orphan.insert(field.to_string(), Value::Null);
                    let _ = self.apply_update(tables, child, child_id, &orphan);
                } else {
                    self.delete_cascade(tables, child, child_id);
                }
            }
        }
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn read(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, StoreError> {
        self.simulate_latency().await;
        {
            let mut faults = self.faults.lock();
            if faults.fail_next_reads > 0 {
                faults.fail_next_reads -= 1;
                return Err(StoreError::Network("injected read failure".into()));
            }
        }
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn write(&self, table: Table, id: RowId, fields: Row) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_write(Some(id))?;
        let mut tables = self.tables.write();
        self.apply_update(&mut tables, table, id, &fields)?;
        debug!(%table, %id, fields = fields.len(), "row updated");
        self.record(WriteOp::Update, table, id, fields);
        Ok(())
    }

    async fn create(&self, table: Table, mut fields: Row) -> Result<RowId, StoreError> {
        self.simulate_latency().await;
        self.check_write(None)?;
        let id = RowId::new();
        fields.insert("id".into(), id.to_json());
        let mut tables = self.tables.write();
        tables.entry(table).or_default().insert(id, fields.clone());
        self.send(ChangeEvent::insert(table, fields.clone()));
        debug!(%table, %id, "row created");
        self.record(WriteOp::Create, table, id, fields);
        Ok(id)
    }

    async fn delete(&self, table: Table, id: RowId) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_write(Some(id))?;
        let mut tables = self.tables.write();
        if !tables.get(&table).is_some_and(|t| t.contains_key(&id)) {
            return Err(StoreError::NotFound { table, id });
        }
        self.delete_cascade(&mut tables, table, id);
        debug!(%table, %id, "row deleted");
        self.record(WriteOp::Delete, table, id, Row::new());
        Ok(())
    }

    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        match self.channels.get(&table) {
            Some(tx) => tx.subscribe(),
            // Every table gets a channel in `new`.
            None => broadcast::channel(1).1,
        }
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn write_batch(&self, table: Table, writes: Vec<(RowId, Row)>) -> Result<(), StoreError> {
        if !self.transactional {
            return Err(StoreError::Unsupported("write_batch"));
        }
        self.simulate_latency().await;
        for (id, _) in &writes {
            self.check_write(Some(*id))?;
        }
        let mut tables = self.tables.write();
        for (id, _) in &writes {
            if !tables.get(&table).is_some_and(|t| t.contains_key(id)) {
                return Err(StoreError::NotFound { table, id: *id });
            }
        }
        for (id, fields) in writes {
            self.apply_update(&mut tables, table, id, &fields)?;
            self.record(WriteOp::Update, table, id, fields);
        }
        debug!(%table, "batch committed");
        Ok(())
    }
}

struct HubChannel {
    members: IndexMap<SessionId, PresenceMember>,
    subscribers: Vec<(SessionId, mpsc::UnboundedSender<PresenceEvent>)>,
}

impl HubChannel {
    fn broadcast(&mut self, event: PresenceEvent) {
        self.subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// Ephemeral [`PresenceTransport`] shared by every session in a process.
#[derive(Default)]
pub struct MemoryPresenceHub {
    channels: Mutex<HashMap<String, HubChannel>>,
}

impl MemoryPresenceHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions currently tracked on `channel`.
    pub fn sessions(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map(|c| c.members.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PresenceTransport for MemoryPresenceHub {
    async fn join(
        &self,
        channel: &str,
        session: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock();
        let chan = channels.entry(channel.to_string()).or_insert_with(|| HubChannel {
            members: IndexMap::new(),
            subscribers: Vec::new(),
        });
        let _ = tx.send(PresenceEvent::Sync(chan.members.values().cloned().collect()));
        chan.subscribers.push((session, tx));
        Ok(rx)
    }

    async fn track(&self, channel: &str, member: PresenceMember) -> Result<(), StoreError> {
        let mut channels = self.channels.lock();
        let chan = channels.get_mut(channel).ok_or(StoreError::Closed)?;
        chan.members.insert(member.session_id, member.clone());
        chan.broadcast(PresenceEvent::Join(member));
        Ok(())
    }

    async fn leave(&self, channel: &str, session: SessionId) -> Result<(), StoreError> {
        let mut channels = self.channels.lock();
        let Some(chan) = channels.get_mut(channel) else {
            return Ok(());
        };
        chan.subscribers.retain(|(s, _)| *s != session);
        if let Some(member) = chan.members.shift_remove(&session) {
            chan.broadcast(PresenceEvent::Leave(member));
        }
        Ok(())
    }
}
