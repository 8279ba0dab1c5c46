//! Durable command bus: command queue, append-only event log, app-state
//! key/value store and the command audit trail, all in one single-writer
//! embedded database.
//!
//! Ingress processes only ever call [`BusStore::enqueue`]; the worker is the
//! sole mutator of command status. Readers take snapshot reads.

use crate::clock::Clock;
use crate::persistence::redb_store::{RedbStore, StoreError};
use crate::policy::{classify, Risk};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

// Tables
const COMMANDS: TableDefinition<u64, Vec<u8>> = TableDefinition::new("commands");
const COMMAND_IDS: TableDefinition<&str, u64> = TableDefinition::new("command_ids");
const DEDUPE_INDEX: TableDefinition<&str, u64> = TableDefinition::new("commands_dedupe");
const EVENTS: TableDefinition<u64, Vec<u8>> = TableDefinition::new("events");
const APP_STATE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("app_state");
const AUDIT: TableDefinition<u64, Vec<u8>> = TableDefinition::new("command_audit");

/// Default command TTL when the caller does not pass one.
pub const DEFAULT_TTL: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cli,
    Chat,
    Supervisor,
    Test,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cli => "cli",
            Source::Chat => "chat",
            Source::Supervisor => "supervisor",
            Source::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    New,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
    Ok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub cmd_id: String,
    pub cmd: String,
    pub args: Value,
    pub source: Source,
    pub status: CommandStatus,
    pub dedupe_key: Option<String>,
    pub retry_count: u32,
    pub available_at: i64,
    pub ttl_sec: Option<i64>,
    pub created_at: i64,
    pub actor_id: Option<String>,
    pub risk_level: Risk,
    pub last_error: Option<String>,
}

impl Command {
    fn ttl_expired(&self, now: i64) -> bool {
        match self.ttl_sec {
            Some(ttl) => now > self.created_at + ttl.max(0),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub ts: i64,
    pub level: EventLevel,
    pub message: String,
    pub fields: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEntry {
    value: String,
    updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditEntry {
    ts: i64,
    cmd_id: String,
    phase: String,
    payload: Value,
}

/// Parameters for [`BusStore::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub cmd: String,
    pub args: Value,
    pub source: Source,
    pub ttl_sec: Option<i64>,
    pub dedupe_key: Option<String>,
    pub actor_id: Option<String>,
}

impl EnqueueRequest {
    pub fn new(cmd: &str, source: Source) -> Self {
        Self {
            cmd: cmd.to_string(),
            args: json!({}),
            source,
            ttl_sec: Some(DEFAULT_TTL),
            dedupe_key: None,
            actor_id: None,
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn ttl(mut self, ttl_sec: Option<i64>) -> Self {
        self.ttl_sec = ttl_sec;
        self
    }

    pub fn dedupe_key(mut self, key: &str) -> Self {
        self.dedupe_key = Some(key.to_string());
        self
    }

    pub fn actor(mut self, actor_id: &str) -> Self {
        self.actor_id = Some(actor_id.to_string());
        self
    }
}

/// Stable dedupe key for callers that want idempotent enqueue without
/// inventing their own keys: `<cmd>:<first 16 hex of sha256(canonical args)>`.
pub fn stable_dedupe_key(cmd: &str, args: &Value) -> String {
    let payload = json!({"cmd": cmd, "args": args});
    let canonical = serde_json::to_string(&payload).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{}:{}", cmd, &hex::encode(digest)[..16])
}

#[derive(Clone)]
pub struct BusStore {
    store: Arc<RedbStore>,
    clock: Arc<dyn Clock>,
}

impl BusStore {
    pub fn new(store: Arc<RedbStore>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let bus = Self { store, clock };
        bus.init_tables()?;
        Ok(bus)
    }

    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let store = Arc::new(RedbStore::open(path)?);
        Self::new(store, clock)
    }

    pub fn database(&self) -> Arc<RedbStore> {
        self.store.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let _ = txn.open_table(COMMANDS)?;
            let _ = txn.open_table(COMMAND_IDS)?;
            let _ = txn.open_table(DEDUPE_INDEX)?;
            let _ = txn.open_table(EVENTS)?;
            let _ = txn.open_table(APP_STATE)?;
            let _ = txn.open_table(AUDIT)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Insert a NEW command, or return the existing id when a dedupe key
    /// matches a command that is still NEW.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<String, StoreError> {
        let now = self.clock.now_epoch();
        let risk = classify(&req.cmd).risk;
        let txn = self.store.begin_write()?;

        if let Some(key) = req.dedupe_key.as_deref() {
            let existing = {
                let dedupe = txn.open_table(DEDUPE_INDEX)?;
                let commands = txn.open_table(COMMANDS)?;
                let result = match dedupe.get(key)? {
                    Some(row) => {
                        let raw = commands
                            .get(row.value())?
                            .ok_or_else(|| StoreError::Integrity("dangling dedupe index".into()))?;
                        let cmd: Command = serde_json::from_slice(&raw.value())?;
                        if cmd.status == CommandStatus::New {
                            Some(cmd.cmd_id)
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                result
            };
            if let Some(cmd_id) = existing {
                // Transaction dropped without commit; nothing written.
                debug!(cmd = %req.cmd, dedupe_key = key, "enqueue collapsed onto {}", cmd_id);
                return Ok(cmd_id);
            }
        }

        let cmd_id = format!("cmd_{}", Uuid::new_v4().simple());
        let record = Command {
            cmd_id: cmd_id.clone(),
            cmd: req.cmd.clone(),
            args: req.args.clone(),
            source: req.source,
            status: CommandStatus::New,
            dedupe_key: req.dedupe_key.clone(),
            retry_count: 0,
            available_at: now,
            ttl_sec: req.ttl_sec,
            created_at: now,
            actor_id: req.actor_id.clone(),
            risk_level: risk,
            last_error: None,
        };
        {
            let mut commands = txn.open_table(COMMANDS)?;
            let row_id = commands.last()?.map(|(k, _)| k.value()).unwrap_or(0) + 1;
            commands.insert(row_id, serde_json::to_vec(&record)?)?;
            let mut ids = txn.open_table(COMMAND_IDS)?;
            ids.insert(cmd_id.as_str(), row_id)?;
            if let Some(key) = req.dedupe_key.as_deref() {
                let mut dedupe = txn.open_table(DEDUPE_INDEX)?;
                dedupe.insert(key, row_id)?;
            }
            append_audit(&txn, now, &cmd_id, "enqueue", json!({
                "cmd": req.cmd,
                "source": req.source.as_str(),
                "actor_id": req.actor_id,
                "ttl": req.ttl_sec,
                "dedupe_key": req.dedupe_key,
                "risk_level": risk.as_str(),
            }))?;
        }
        txn.commit()?;
        Ok(cmd_id)
    }

    /// Oldest NEW command whose `available_at` has passed. Commands whose TTL
    /// already lapsed are marked ERROR with reason `ttl.expired` on the way,
    /// each with a `command.ttl.expired` event, and scanning continues.
    pub fn next_new(&self) -> Result<Option<Command>, StoreError> {
        self.next_new_filtered(None)
    }

    /// Oldest eligible NEW command with the given dotted name. Used by the
    /// worker while the breaker is tripped to locate `state.resume` without
    /// executing anything else.
    pub fn next_new_named(&self, cmd: &str) -> Result<Option<Command>, StoreError> {
        self.next_new_filtered(Some(cmd))
    }

    fn next_new_filtered(&self, name: Option<&str>) -> Result<Option<Command>, StoreError> {
        let now = self.clock.now_epoch();
        loop {
            let candidate = {
                let txn = self.store.begin_read()?;
                let commands = txn.open_table(COMMANDS)?;
                let mut found: Option<(u64, Command)> = None;
                for entry in commands.range(0u64..)? {
                    let (k, v) = entry?;
                    let cmd: Command = serde_json::from_slice(&v.value())?;
                    if cmd.status != CommandStatus::New || cmd.available_at > now {
                        continue;
                    }
                    // Expired commands are swept regardless of the name filter.
                    if !cmd.ttl_expired(now) {
                        if let Some(wanted) = name {
                            if cmd.cmd != wanted {
                                continue;
                            }
                        }
                    }
                    found = Some((k.value(), cmd));
                    break;
                }
                found
            };
            match candidate {
                None => return Ok(None),
                Some((row_id, cmd)) if cmd.ttl_expired(now) => {
                    self.expire_command(row_id, &cmd, now)?;
                    continue;
                }
                Some((_, cmd)) => {
                    self.audit(&cmd.cmd_id, "dispatch", json!({
                        "source": cmd.source.as_str(),
                        "actor_id": cmd.actor_id.clone(),
                        "risk_level": cmd.risk_level.as_str(),
                    }))?;
                    return Ok(Some(cmd));
                }
            }
        }
    }

    fn expire_command(&self, row_id: u64, cmd: &Command, now: i64) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut commands = txn.open_table(COMMANDS)?;
            let mut updated = cmd.clone();
            updated.status = CommandStatus::Error;
            updated.last_error = Some("ttl.expired".to_string());
            commands.insert(row_id, serde_json::to_vec(&updated)?)?;
            append_audit(&txn, now, &cmd.cmd_id, "expired", json!({
                "reason": "ttl",
                "created_at": cmd.created_at,
                "ttl": cmd.ttl_sec,
                "now": now,
            }))?;
            append_event(&txn, now, EventLevel::Warn, "command.ttl.expired", &json!({
                "cmd_id": cmd.cmd_id.clone(),
                "cmd": cmd.cmd.clone(),
                "source": cmd.source.as_str(),
                "actor_id": cmd.actor_id.clone(),
                "risk": cmd.risk_level.as_str(),
            }))?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn mark_done(&self, cmd_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now_epoch();
        let txn = self.store.begin_write()?;
        {
            self.update_command(&txn, cmd_id, |cmd| {
                cmd.status = CommandStatus::Done;
            })?;
            append_audit(&txn, now, cmd_id, "done", json!({}))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Mark a command failed. With `backoff_sec` the command stays NEW with a
    /// bumped retry counter and a deferred `available_at`; the store never
    /// schedules retries by itself. Either way a `command.error` event is
    /// recorded.
    pub fn mark_error(
        &self,
        cmd_id: &str,
        reason: &str,
        backoff_sec: Option<i64>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_epoch();
        let txn = self.store.begin_write()?;
        {
            let retry_count = match backoff_sec {
                None => {
                    self.update_command(&txn, cmd_id, |cmd| {
                        cmd.status = CommandStatus::Error;
                        cmd.last_error = Some(reason.to_string());
                    })?
                }
                Some(backoff) => {
                    self.update_command(&txn, cmd_id, |cmd| {
                        cmd.retry_count += 1;
                        cmd.available_at = now + backoff.max(0);
                        cmd.last_error = Some(reason.to_string());
                    })?
                }
            };
            append_audit(&txn, now, cmd_id, "error", json!({
                "error": reason,
                "backoff_sec": backoff_sec,
            }))?;
            append_event(&txn, now, EventLevel::Warn, "command.error", &json!({
                "cmd_id": cmd_id,
                "reason": reason,
                "retry_count": retry_count,
                "backoff": backoff_sec,
            }))?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Apply a mutation to the stored command, returning its retry count.
    fn update_command(
        &self,
        txn: &redb::WriteTransaction<'_>,
        cmd_id: &str,
        mutate: impl FnOnce(&mut Command),
    ) -> Result<u32, StoreError> {
        let row_id = {
            let ids = txn.open_table(COMMAND_IDS)?;
            let result = ids
                .get(cmd_id)?
                .map(|v| v.value())
                .ok_or_else(|| StoreError::Integrity(format!("unknown cmd_id {cmd_id}")))?;
            result
        };
        let mut commands = txn.open_table(COMMANDS)?;
        let mut cmd: Command = {
            let raw = commands
                .get(row_id)?
                .ok_or_else(|| StoreError::Integrity(format!("missing row for {cmd_id}")))?;
            serde_json::from_slice(&raw.value())?
        };
        mutate(&mut cmd);
        let retry = cmd.retry_count;
        commands.insert(row_id, serde_json::to_vec(&cmd)?)?;
        Ok(retry)
    }

    pub fn get_command(&self, cmd_id: &str) -> Result<Option<Command>, StoreError> {
        let txn = self.store.begin_read()?;
        let ids = txn.open_table(COMMAND_IDS)?;
        let row_id = match ids.get(cmd_id)? {
            Some(v) => v.value(),
            None => return Ok(None),
        };
        let commands = txn.open_table(COMMANDS)?;
        let result = match commands.get(row_id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw.value())?)),
            None => Ok(None),
        };
        result
    }

    /// All NEW commands in queue order. Used by the CLI drain preview.
    pub fn list_new(&self) -> Result<Vec<Command>, StoreError> {
        let txn = self.store.begin_read()?;
        let commands = txn.open_table(COMMANDS)?;
        let mut out = Vec::new();
        for entry in commands.range(0u64..)? {
            let (_, v) = entry?;
            let cmd: Command = serde_json::from_slice(&v.value())?;
            if cmd.status == CommandStatus::New {
                out.push(cmd);
            }
        }
        Ok(out)
    }

    pub fn count_by_status(&self) -> Result<(usize, usize, usize), StoreError> {
        let txn = self.store.begin_read()?;
        let commands = txn.open_table(COMMANDS)?;
        let (mut new, mut done, mut error) = (0usize, 0usize, 0usize);
        for entry in commands.range(0u64..)? {
            let (_, v) = entry?;
            let cmd: Command = serde_json::from_slice(&v.value())?;
            match cmd.status {
                CommandStatus::New => new += 1,
                CommandStatus::Done => done += 1,
                CommandStatus::Error => error += 1,
            }
        }
        Ok((new, done, error))
    }

    /// Append an event. Ids are strictly monotonic per database.
    pub fn emit(&self, level: EventLevel, message: &str, fields: Value) -> Result<u64, StoreError> {
        let now = self.clock.now_epoch();
        let txn = self.store.begin_write()?;
        let id = append_event(&txn, now, level, message, &fields)?;
        txn.commit()?;
        Ok(id)
    }

    /// Last `limit` events, newest first. With `since_id`, only events with a
    /// strictly greater id are returned.
    pub fn tail_events(&self, limit: usize, since_id: Option<u64>) -> Result<Vec<Event>, StoreError> {
        let txn = self.store.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let last = match events.last()? {
            Some((k, _)) => k.value(),
            None => return Ok(Vec::new()),
        };
        let floor = since_id.unwrap_or(0);
        let mut out = Vec::new();
        let mut id = last;
        while id > floor && out.len() < limit {
            if let Some(raw) = events.get(id)? {
                out.push(serde_json::from_slice(&raw.value())?);
            }
            if id == 0 {
                break;
            }
            id -= 1;
        }
        Ok(out)
    }

    /// Count of events recorded at or after `since_epoch`; feeds the
    /// events-per-minute KPI.
    pub fn events_since(&self, since_epoch: i64) -> Result<usize, StoreError> {
        let txn = self.store.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let last = match events.last()? {
            Some((k, _)) => k.value(),
            None => return Ok(0),
        };
        let mut count = 0usize;
        let mut id = last;
        while id > 0 {
            let event: Event = match events.get(id)? {
                Some(raw) => serde_json::from_slice(&raw.value())?,
                None => break,
            };
            if event.ts < since_epoch {
                break;
            }
            count += 1;
            id -= 1;
        }
        Ok(count)
    }

    /// Last-write-wins app state.
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let entry = StateEntry {
            value: value.to_string(),
            updated_at: self.clock.iso_utc(),
        };
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(APP_STATE)?;
            table.insert(key, serde_json::to_vec(&entry)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(APP_STATE)?;
        let result = match table.get(key)? {
            Some(raw) => {
                let entry: StateEntry = serde_json::from_slice(&raw.value())?;
                Ok(Some(entry.value))
            }
            None => Ok(None),
        };
        result
    }

    fn audit(&self, cmd_id: &str, phase: &str, payload: Value) -> Result<(), StoreError> {
        let now = self.clock.now_epoch();
        let txn = self.store.begin_write()?;
        append_audit(&txn, now, cmd_id, phase, payload)?;
        txn.commit()?;
        Ok(())
    }

    /// Audit phases recorded for a command, in order. Test and diagnostics
    /// surface.
    pub fn audit_phases(&self, cmd_id: &str) -> Result<Vec<String>, StoreError> {
        let txn = self.store.begin_read()?;
        let audit = txn.open_table(AUDIT)?;
        let mut phases = Vec::new();
        for entry in audit.range(0u64..)? {
            let (_, v) = entry?;
            let record: AuditEntry = serde_json::from_slice(&v.value())?;
            if record.cmd_id == cmd_id {
                phases.push(record.phase);
            }
        }
        Ok(phases)
    }
}

fn append_event(
    txn: &redb::WriteTransaction<'_>,
    ts: i64,
    level: EventLevel,
    message: &str,
    fields: &Value,
) -> Result<u64, StoreError> {
    let mut events = txn.open_table(EVENTS)?;
    let id = events.last()?.map(|(k, _)| k.value()).unwrap_or(0) + 1;
    let record = Event {
        id,
        ts,
        level,
        message: message.to_string(),
        fields: fields.clone(),
    };
    events.insert(id, serde_json::to_vec(&record)?)?;
    crate::metrics::EVENTS_EMITTED.inc();
    Ok(id)
}

fn append_audit(
    txn: &redb::WriteTransaction<'_>,
    ts: i64,
    cmd_id: &str,
    phase: &str,
    payload: Value,
) -> Result<(), StoreError> {
    let mut audit = txn.open_table(AUDIT)?;
    let id = audit.last()?.map(|(k, _)| k.value()).unwrap_or(0) + 1;
    let record = AuditEntry {
        ts,
        cmd_id: cmd_id.to_string(),
        phase: phase.to_string(),
        payload,
    };
    audit.insert(id, serde_json::to_vec(&record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::TempDir;

    fn bus_at(t: i64) -> (BusStore, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(t));
        let bus = BusStore::open(dir.path().join("ctl.db"), clock.clone()).unwrap();
        (bus, clock, dir)
    }

    #[test]
    fn enqueue_then_next_new_roundtrip() {
        let (bus, _, _dir) = bus_at(1_000);
        let id = bus
            .enqueue(EnqueueRequest::new("state.pause", Source::Cli).actor("cli:1"))
            .unwrap();
        let cmd = bus.next_new().unwrap().expect("command available");
        assert_eq!(cmd.cmd_id, id);
        assert_eq!(cmd.cmd, "state.pause");
        assert_eq!(cmd.source, Source::Cli);
        assert_eq!(cmd.status, CommandStatus::New);
        assert_eq!(bus.audit_phases(&id).unwrap(), vec!["enqueue", "dispatch"]);
    }

    #[test]
    fn dedupe_collapses_onto_active_command() {
        let (bus, _, _dir) = bus_at(1_000);
        let first = bus
            .enqueue(EnqueueRequest::new("orders.confirm", Source::Chat).dedupe_key("k1"))
            .unwrap();
        let second = bus
            .enqueue(EnqueueRequest::new("orders.confirm", Source::Chat).dedupe_key("k1"))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(bus.list_new().unwrap().len(), 1);
    }

    #[test]
    fn dedupe_releases_after_terminal_state() {
        let (bus, _, _dir) = bus_at(1_000);
        let first = bus
            .enqueue(EnqueueRequest::new("orders.confirm", Source::Chat).dedupe_key("k1"))
            .unwrap();
        bus.mark_done(&first).unwrap();
        let second = bus
            .enqueue(EnqueueRequest::new("orders.confirm", Source::Chat).dedupe_key("k1"))
            .unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn ttl_zero_expires_immediately() {
        let (bus, clock, _dir) = bus_at(1_000);
        let id = bus
            .enqueue(EnqueueRequest::new("orders.pending", Source::Cli).ttl(Some(0)))
            .unwrap();
        clock.advance(1);
        assert!(bus.next_new().unwrap().is_none());
        let cmd = bus.get_command(&id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Error);
        assert_eq!(cmd.last_error.as_deref(), Some("ttl.expired"));
        let events = bus.tail_events(5, None).unwrap();
        assert!(events.iter().any(|e| e.message == "command.ttl.expired"));
        assert!(bus.audit_phases(&id).unwrap().contains(&"expired".to_string()));
    }

    #[test]
    fn ttl_survives_until_deadline() {
        let (bus, clock, _dir) = bus_at(1_000);
        bus.enqueue(EnqueueRequest::new("state.pause", Source::Cli).ttl(Some(10)))
            .unwrap();
        clock.advance(10);
        // now == created_at + ttl: still eligible
        assert!(bus.next_new().unwrap().is_some());
        clock.advance(1);
        assert!(bus.next_new().unwrap().is_none());
    }

    #[test]
    fn mark_error_with_backoff_keeps_command_new() {
        let (bus, clock, _dir) = bus_at(1_000);
        let id = bus
            .enqueue(EnqueueRequest::new("state.pause", Source::Cli).ttl(None))
            .unwrap();
        bus.mark_error(&id, "transient", Some(30)).unwrap();
        let cmd = bus.get_command(&id).unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::New);
        assert_eq!(cmd.retry_count, 1);
        assert!(bus.next_new().unwrap().is_none(), "deferred by backoff");
        clock.advance(31);
        assert!(bus.next_new().unwrap().is_some());
    }

    #[test]
    fn event_ids_are_strictly_monotonic() {
        let (bus, _, _dir) = bus_at(1_000);
        let a = bus.emit(EventLevel::Info, "one", json!({})).unwrap();
        let b = bus.emit(EventLevel::Ok, "two", json!({})).unwrap();
        let c = bus.emit(EventLevel::Error, "three", json!({})).unwrap();
        assert!(a < b && b < c);
        let tail = bus.tail_events(2, None).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].message, "three");
        assert_eq!(tail[1].message, "two");
    }

    #[test]
    fn tail_events_since_id_excludes_older() {
        let (bus, _, _dir) = bus_at(1_000);
        let first = bus.emit(EventLevel::Info, "one", json!({})).unwrap();
        bus.emit(EventLevel::Info, "two", json!({})).unwrap();
        let tail = bus.tail_events(10, Some(first)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "two");
    }

    #[test]
    fn app_state_is_last_write_wins() {
        let (bus, _, _dir) = bus_at(1_000);
        assert_eq!(bus.get_state("state").unwrap(), None);
        bus.set_state("state", "RUN").unwrap();
        bus.set_state("state", "PAUSED").unwrap();
        assert_eq!(bus.get_state("state").unwrap().as_deref(), Some("PAUSED"));
    }

    #[test]
    fn stable_dedupe_key_is_deterministic() {
        let a = stable_dedupe_key("state.pause", &json!({"reason": "x"}));
        let b = stable_dedupe_key("state.pause", &json!({"reason": "x"}));
        let c = stable_dedupe_key("state.pause", &json!({"reason": "y"}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("state.pause:"));
    }

    #[test]
    fn next_new_named_skips_other_commands() {
        let (bus, _, _dir) = bus_at(1_000);
        bus.enqueue(EnqueueRequest::new("state.pause", Source::Cli))
            .unwrap();
        let resume = bus
            .enqueue(EnqueueRequest::new("state.resume", Source::Cli))
            .unwrap();
        let found = bus.next_new_named("state.resume").unwrap().unwrap();
        assert_eq!(found.cmd_id, resume);
        // the pause stayed NEW and is still first in line
        let head = bus.next_new().unwrap().unwrap();
        assert_eq!(head.cmd, "state.pause");
    }
}
