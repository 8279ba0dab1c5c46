//! Ticket registry backed by the shared control database.
//!
//! Tickets are indexed by a short human token (A-Z without O/I, digits 2-9)
//! for quick voice/keyboard entry. Every state change lands in an
//! append-only order event log.

use crate::clock::Clock;
use crate::orders::schema::{OrderState, OrderTicket, TransitionError};
use crate::persistence::redb_store::{RedbStore, StoreError};
use rand::Rng;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

const ORDERS: TableDefinition<&str, Vec<u8>> = TableDefinition::new("orders");
const TOKEN_INDEX: TableDefinition<&str, &str> = TableDefinition::new("order_tokens");
const ORDER_EVENTS: TableDefinition<u64, Vec<u8>> = TableDefinition::new("order_events");

/// Excludes 0, O, 1, I to keep tokens unambiguous.
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Error, Debug)]
pub enum OrderError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("unknown order {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderEventRecord {
    ts: i64,
    event: String,
    order_id: String,
    token: String,
    state: Option<OrderState>,
    reason: Option<String>,
}

pub fn generate_token(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length.max(3))
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Generate a token not present in `existing` (case-insensitive). Widens the
/// length when the space looks exhausted.
fn unique_token(existing: &HashSet<String>, length: usize) -> String {
    let mut len = length.max(3);
    let mut attempts = 0usize;
    loop {
        let token = generate_token(len);
        if !existing.contains(&token.to_ascii_uppercase()) {
            return token;
        }
        attempts += 1;
        if attempts > 500 {
            attempts = 0;
            len += 1;
        }
    }
}

#[derive(Clone)]
pub struct OrderStore {
    store: Arc<RedbStore>,
    clock: Arc<dyn Clock>,
    token_len: usize,
}

impl OrderStore {
    pub fn new(
        store: Arc<RedbStore>,
        clock: Arc<dyn Clock>,
        token_len: usize,
    ) -> Result<Self, StoreError> {
        let txn = store.begin_write()?;
        {
            let _ = txn.open_table(ORDERS)?;
            let _ = txn.open_table(TOKEN_INDEX)?;
            let _ = txn.open_table(ORDER_EVENTS)?;
        }
        txn.commit()?;
        Ok(Self {
            store,
            clock,
            token_len,
        })
    }

    /// Insert or replace a ticket, assigning a unique token when missing.
    pub fn put(&self, mut ticket: OrderTicket) -> Result<OrderTicket, StoreError> {
        let now = self.clock.now_epoch();
        let txn = self.store.begin_write()?;
        {
            let mut tokens = txn.open_table(TOKEN_INDEX)?;
            if ticket.token.is_empty() {
                let used: HashSet<String> = {
                    let mut set = HashSet::new();
                    for entry in tokens.range::<&str>(..)? {
                        let (k, _) = entry?;
                        set.insert(k.value().to_ascii_uppercase());
                    }
                    set
                };
                ticket.token = unique_token(&used, self.token_len);
            }
            tokens.insert(ticket.token.to_ascii_uppercase().as_str(), ticket.id.as_str())?;
            let mut orders = txn.open_table(ORDERS)?;
            orders.insert(ticket.id.as_str(), serde_json::to_vec(&ticket)?)?;
            append_order_event(&txn, now, "order.put", &ticket, None)?;
        }
        txn.commit()?;
        Ok(ticket)
    }

    pub fn get(&self, id: &str) -> Result<Option<OrderTicket>, StoreError> {
        let txn = self.store.begin_read()?;
        let orders = txn.open_table(ORDERS)?;
        let result = match orders.get(id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Case-insensitive token lookup.
    pub fn resolve_by_token(&self, token: &str) -> Result<Option<OrderTicket>, StoreError> {
        let needle = token.trim().to_ascii_uppercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let txn = self.store.begin_read()?;
        let tokens = txn.open_table(TOKEN_INDEX)?;
        let id = match tokens.get(needle.as_str())? {
            Some(v) => v.value().to_string(),
            None => return Ok(None),
        };
        let orders = txn.open_table(ORDERS)?;
        let result = match orders.get(id.as_str())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Guarded state transition with an audit trail entry.
    pub fn set_state(
        &self,
        id: &str,
        next: OrderState,
        reason: Option<&str>,
        touched_by: Option<(&str, &str)>,
    ) -> Result<OrderTicket, OrderError> {
        let mut ticket = self
            .get(id)?
            .ok_or_else(|| OrderError::Unknown(id.to_string()))?;
        ticket.transition(next)?;
        if let Some((source, actor)) = touched_by {
            ticket.record_actor(source, actor);
        }
        self.save(&ticket, reason)?;
        Ok(ticket)
    }

    fn save(&self, ticket: &OrderTicket, reason: Option<&str>) -> Result<(), StoreError> {
        let now = self.clock.now_epoch();
        let txn = self.store.begin_write()?;
        {
            let mut orders = txn.open_table(ORDERS)?;
            orders.insert(ticket.id.as_str(), serde_json::to_vec(ticket)?)?;
            append_order_event(&txn, now, "order.state", ticket, reason)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn list(&self, state: Option<OrderState>) -> Result<Vec<OrderTicket>, StoreError> {
        let txn = self.store.begin_read()?;
        let orders = txn.open_table(ORDERS)?;
        let mut out = Vec::new();
        for entry in orders.range::<&str>(..)? {
            let (_, v) = entry?;
            let ticket: OrderTicket = serde_json::from_slice(&v.value())?;
            if state.map(|s| ticket.state == s).unwrap_or(true) {
                out.push(ticket);
            }
        }
        Ok(out)
    }

    pub fn counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for ticket in self.list(None)? {
            *counts.entry(ticket.state.as_str().to_string()).or_default() += 1;
        }
        Ok(counts)
    }

    /// Tickets awaiting confirmation (PENDING or CONFIRMED_CHAT), newest
    /// first. Feeds chat menus and dashboards.
    pub fn pending(&self, limit: usize) -> Result<Vec<OrderTicket>, StoreError> {
        let mut rows: Vec<OrderTicket> = self
            .list(None)?
            .into_iter()
            .filter(|t| matches!(t.state, OrderState::Pending | OrderState::ConfirmedChat))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit.max(1));
        Ok(rows)
    }

    /// Bulk-cancel every non-terminal unconfirmed ticket. Returns the tokens
    /// that were canceled. Kill-switch path.
    pub fn cancel_active(&self, reason: &str) -> Result<Vec<String>, OrderError> {
        let mut canceled = Vec::new();
        for ticket in self.pending(usize::MAX - 1)? {
            self.set_state(&ticket.id, OrderState::Canceled, Some(reason), None)?;
            canceled.push(ticket.token.clone());
        }
        Ok(canceled)
    }

    /// Expire unconfirmed tickets whose `expires_at` lapsed. Returns expired
    /// tokens.
    pub fn expire_due(&self) -> Result<Vec<String>, OrderError> {
        let now = self.clock.now_utc();
        let mut expired = Vec::new();
        for ticket in self.pending(usize::MAX - 1)? {
            if let Some(deadline) = ticket.expires_at {
                if deadline < now {
                    self.set_state(&ticket.id, OrderState::Expired, Some("confirm_window"), None)?;
                    expired.push(ticket.token.clone());
                }
            }
        }
        Ok(expired)
    }
}

fn append_order_event(
    txn: &redb::WriteTransaction<'_>,
    ts: i64,
    event: &str,
    ticket: &OrderTicket,
    reason: Option<&str>,
) -> Result<(), StoreError> {
    let mut log = txn.open_table(ORDER_EVENTS)?;
    let id = log.last()?.map(|(k, _)| k.value()).unwrap_or(0) + 1;
    let record = OrderEventRecord {
        ts,
        event: event.to_string(),
        order_id: ticket.id.clone(),
        token: ticket.token.clone(),
        state: Some(ticket.state),
        reason: reason.map(|r| r.to_string()),
    };
    log.insert(id, serde_json::to_vec(&record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::orders::schema::{OrderType, Side};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn store() -> (OrderStore, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(50_000));
        let redb = Arc::new(RedbStore::open(dir.path().join("ctl.db")).unwrap());
        let orders = OrderStore::new(redb, clock.clone(), 6).unwrap();
        (orders, clock, dir)
    }

    fn new_ticket(clock: &ManualClock, symbol: &str) -> OrderTicket {
        OrderTicket::new(
            symbol,
            Side::Buy,
            dec!(1),
            OrderType::Market,
            None,
            None,
            Some(120),
            clock.now_utc(),
        )
    }

    #[test]
    fn put_assigns_unique_tokens() {
        let (store, clock, _dir) = store();
        let a = store.put(new_ticket(&clock, "AAPL")).unwrap();
        let b = store.put(new_ticket(&clock, "MSFT")).unwrap();
        assert_eq!(a.token.len(), 6);
        assert_ne!(a.token, b.token);
        for c in a.token.chars() {
            assert!(!"0O1I".contains(c), "ambiguous char {c} in token");
        }
    }

    #[test]
    fn token_lookup_is_case_insensitive() {
        let (store, clock, _dir) = store();
        let t = store.put(new_ticket(&clock, "AAPL")).unwrap();
        let found = store
            .resolve_by_token(&t.token.to_ascii_lowercase())
            .unwrap()
            .expect("resolved");
        assert_eq!(found.id, t.id);
    }

    #[test]
    fn set_state_rejects_illegal_transition() {
        let (store, clock, _dir) = store();
        let t = store.put(new_ticket(&clock, "AAPL")).unwrap();
        store
            .set_state(&t.id, OrderState::Rejected, Some("operator"), None)
            .unwrap();
        let err = store.set_state(&t.id, OrderState::Confirmed, None, None);
        assert!(matches!(err, Err(OrderError::Transition(_))));
    }

    #[test]
    fn cancel_active_sweeps_pending_and_chat_confirmed() {
        let (store, clock, _dir) = store();
        let a = store.put(new_ticket(&clock, "AAPL")).unwrap();
        let b = store.put(new_ticket(&clock, "MSFT")).unwrap();
        store
            .set_state(&b.id, OrderState::ConfirmedChat, None, None)
            .unwrap();
        let c = store.put(new_ticket(&clock, "NVDA")).unwrap();
        store
            .set_state(&c.id, OrderState::Confirmed, None, None)
            .unwrap();

        let canceled = store.cancel_active("killswitch").unwrap();
        assert_eq!(canceled.len(), 2);
        assert!(canceled.contains(&a.token));
        assert!(canceled.contains(&b.token));
        // fully confirmed ticket untouched
        assert_eq!(store.get(&c.id).unwrap().unwrap().state, OrderState::Confirmed);
    }

    #[test]
    fn expire_due_respects_deadline() {
        let (store, clock, _dir) = store();
        let t = store.put(new_ticket(&clock, "AAPL")).unwrap();
        assert!(store.expire_due().unwrap().is_empty());
        clock.advance(121);
        let expired = store.expire_due().unwrap();
        assert_eq!(expired, vec![t.token.clone()]);
        assert_eq!(store.get(&t.id).unwrap().unwrap().state, OrderState::Expired);
    }

    #[test]
    fn counts_group_by_state() {
        let (store, clock, _dir) = store();
        store.put(new_ticket(&clock, "AAPL")).unwrap();
        store.put(new_ticket(&clock, "MSFT")).unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.get("PENDING"), Some(&2));
    }

    #[test]
    fn unique_token_widens_on_exhaustion() {
        let mut existing = HashSet::new();
        existing.insert("AAA".to_string());
        let token = unique_token(&existing, 3);
        assert_ne!(token, "AAA");
        assert!(token.len() >= 3);
    }
}
