//! Dual-control approval ledger.
//!
//! High-risk commands require approvals from distinct sources (and distinct
//! actors under strict mode) within a time window. Approvals are keyed by
//! `(cmd_name, identity)` so two commands targeting the same order share one
//! record. Fulfilled and expired approvals are terminal; a later offer for
//! the same key starts a fresh approval.

use crate::bus::{BusStore, EventLevel};
use crate::persistence::redb_store::StoreError;
use crate::policy::Risk;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::json;

const APPROVALS: TableDefinition<&str, Vec<u8>> = TableDefinition::new("approvals");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub cmd_name: String,
    pub identity: String,
    pub risk: Risk,
    pub required: u32,
    pub window_sec: i64,
    pub sources_seen: Vec<String>,
    pub actors_seen: Vec<String>,
    pub created_at: i64,
    pub fulfilled_at: Option<i64>,
    pub expired_at: Option<i64>,
}

impl Approval {
    pub fn is_terminal(&self) -> bool {
        self.fulfilled_at.is_some() || self.expired_at.is_some()
    }

    pub fn age_sec(&self, now: i64) -> i64 {
        (now - self.created_at).max(0)
    }

    fn window_lapsed(&self, now: i64) -> bool {
        now - self.created_at > self.window_sec
    }

    fn key(&self) -> String {
        approval_key(&self.cmd_name, &self.identity)
    }
}

fn approval_key(cmd_name: &str, identity: &str) -> String {
    format!("{cmd_name}:{identity}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Pending,
    Fulfilled,
    DuplicateSource,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Offer {
    pub decision: ApprovalDecision,
    pub approval: Approval,
}

#[derive(Clone)]
pub struct ApprovalLedger {
    bus: BusStore,
    strict_actors: bool,
}

impl ApprovalLedger {
    pub fn new(bus: BusStore, strict_actors: bool) -> Result<Self, StoreError> {
        let db = bus.database();
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(APPROVALS)?;
        }
        txn.commit()?;
        Ok(Self { bus, strict_actors })
    }

    /// Register one approval offer. Sweeps expired approvals first, then
    /// applies the distinct-source (and, in strict mode, distinct-actor)
    /// rules.
    #[allow(clippy::too_many_arguments)]
    pub fn offer(
        &self,
        cmd_name: &str,
        identity: &str,
        risk: Risk,
        required: u32,
        window_sec: i64,
        source: &str,
        actor_id: Option<&str>,
    ) -> Result<Offer, StoreError> {
        let now = self.bus.clock().now_epoch();
        let swept = self.sweep()?;
        if let Some(expired) = swept
            .into_iter()
            .find(|a| a.cmd_name == cmd_name && a.identity == identity)
        {
            // The pending approval for this key lapsed on this very access;
            // the triggering command is answered with the expiry. The next
            // offer starts fresh.
            return Ok(Offer {
                decision: ApprovalDecision::Expired,
                approval: expired,
            });
        }

        let existing = self.get(cmd_name, identity)?.filter(|a| !a.is_terminal());
        let mut approval = match existing {
            None => {
                let approval = Approval {
                    cmd_name: cmd_name.to_string(),
                    identity: identity.to_string(),
                    risk,
                    required: required.max(1),
                    window_sec,
                    sources_seen: vec![source.to_string()],
                    actors_seen: actor_id.map(|a| a.to_string()).into_iter().collect(),
                    created_at: now,
                    fulfilled_at: None,
                    expired_at: None,
                };
                return self.settle_new(approval, now);
            }
            Some(a) => a,
        };

        if approval.sources_seen.iter().any(|s| s == source) {
            self.bus.emit(EventLevel::Warn, "approval.duplicate_source", json!({
                "cmd_name": cmd_name,
                "identity": identity,
                "risk": risk.as_str(),
                "source": source,
                "sources": approval.sources_seen.clone(),
            }))?;
            return Ok(Offer {
                decision: ApprovalDecision::DuplicateSource,
                approval,
            });
        }
        if self.strict_actors {
            if let Some(actor) = actor_id {
                if approval.actors_seen.iter().any(|a| a == actor) {
                    self.bus.emit(EventLevel::Warn, "approval.duplicate_source", json!({
                        "cmd_name": cmd_name,
                        "identity": identity,
                        "risk": risk.as_str(),
                        "source": source,
                        "actor_id": actor,
                        "note": "duplicate_actor",
                    }))?;
                    return Ok(Offer {
                        decision: ApprovalDecision::DuplicateSource,
                        approval,
                    });
                }
            }
        }

        approval.sources_seen.push(source.to_string());
        if let Some(actor) = actor_id {
            approval.actors_seen.push(actor.to_string());
        }
        if approval.sources_seen.len() as u32 >= approval.required {
            approval.fulfilled_at = Some(now);
            self.put(&approval)?;
            self.bus.emit(EventLevel::Ok, "approval.fulfilled", json!({
                "cmd_name": cmd_name,
                "identity": identity,
                "risk": risk.as_str(),
                "sources": approval.sources_seen.clone(),
            }))?;
            return Ok(Offer {
                decision: ApprovalDecision::Fulfilled,
                approval,
            });
        }
        self.put(&approval)?;
        self.emit_pending(&approval)?;
        Ok(Offer {
            decision: ApprovalDecision::Pending,
            approval,
        })
    }

    fn settle_new(&self, mut approval: Approval, now: i64) -> Result<Offer, StoreError> {
        if approval.sources_seen.len() as u32 >= approval.required {
            approval.fulfilled_at = Some(now);
            self.put(&approval)?;
            self.bus.emit(EventLevel::Ok, "approval.fulfilled", json!({
                "cmd_name": approval.cmd_name.clone(),
                "identity": approval.identity.clone(),
                "risk": approval.risk.as_str(),
                "sources": approval.sources_seen.clone(),
            }))?;
            return Ok(Offer {
                decision: ApprovalDecision::Fulfilled,
                approval,
            });
        }
        self.put(&approval)?;
        self.emit_pending(&approval)?;
        Ok(Offer {
            decision: ApprovalDecision::Pending,
            approval,
        })
    }

    fn emit_pending(&self, approval: &Approval) -> Result<(), StoreError> {
        self.bus.emit(EventLevel::Warn, "approval.pending", json!({
            "cmd_name": approval.cmd_name.clone(),
            "identity": approval.identity.clone(),
            "risk": approval.risk.as_str(),
            "approvals": approval.sources_seen.len(),
            "required": approval.required,
            "sources": approval.sources_seen.clone(),
        }))?;
        Ok(())
    }

    /// Expire pending approvals whose window lapsed. Emits one
    /// `approval.expired` per approval; terminal records are skipped so the
    /// event fires exactly once.
    pub fn sweep(&self) -> Result<Vec<Approval>, StoreError> {
        let now = self.bus.clock().now_epoch();
        let mut lapsed: Vec<Approval> = Vec::new();
        {
            let db = self.bus.database();
            let txn = db.begin_read()?;
            let table = txn.open_table(APPROVALS)?;
            for entry in table.range::<&str>(..)? {
                let (_, v) = entry?;
                let approval: Approval = serde_json::from_slice(&v.value())?;
                if !approval.is_terminal() && approval.window_lapsed(now) {
                    lapsed.push(approval);
                }
            }
        }
        for approval in lapsed.iter_mut() {
            approval.expired_at = Some(now);
            self.put(approval)?;
            self.bus.emit(EventLevel::Warn, "approval.expired", json!({
                "cmd_name": approval.cmd_name.clone(),
                "identity": approval.identity.clone(),
                "risk": approval.risk.as_str(),
                "sources": approval.sources_seen.clone(),
            }))?;
        }
        Ok(lapsed)
    }

    pub fn get(&self, cmd_name: &str, identity: &str) -> Result<Option<Approval>, StoreError> {
        let key = approval_key(cmd_name, identity);
        let db = self.bus.database();
        let txn = db.begin_read()?;
        let table = txn.open_table(APPROVALS)?;
        let result = match table.get(key.as_str())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Approvals still awaiting fulfillment. Projection surface.
    pub fn pending(&self) -> Result<Vec<Approval>, StoreError> {
        let db = self.bus.database();
        let txn = db.begin_read()?;
        let table = txn.open_table(APPROVALS)?;
        let mut out = Vec::new();
        for entry in table.range::<&str>(..)? {
            let (_, v) = entry?;
            let approval: Approval = serde_json::from_slice(&v.value())?;
            if !approval.is_terminal() {
                out.push(approval);
            }
        }
        Ok(out)
    }

    fn put(&self, approval: &Approval) -> Result<(), StoreError> {
        let key = approval.key();
        let db = self.bus.database();
        let txn = db.begin_write()?;
        {
            let mut table = txn.open_table(APPROVALS)?;
            table.insert(key.as_str(), serde_json::to_vec(approval)?)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ledger(strict: bool) -> (ApprovalLedger, BusStore, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(10_000));
        let bus = BusStore::open(dir.path().join("ctl.db"), clock.clone()).unwrap();
        let ledger = ApprovalLedger::new(bus.clone(), strict).unwrap();
        (ledger, bus, clock, dir)
    }

    #[test]
    fn two_distinct_sources_fulfill() {
        let (ledger, _, _, _dir) = ledger(false);
        let first = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", Some("cli:1"))
            .unwrap();
        assert_eq!(first.decision, ApprovalDecision::Pending);
        let second = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "chat", Some("chat:42"))
            .unwrap();
        assert_eq!(second.decision, ApprovalDecision::Fulfilled);
        assert_eq!(second.approval.sources_seen, vec!["cli", "chat"]);
    }

    #[test]
    fn same_source_cannot_double_approve() {
        let (ledger, bus, _, _dir) = ledger(false);
        ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", Some("cli:1"))
            .unwrap();
        let repeat = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", Some("cli:2"))
            .unwrap();
        assert_eq!(repeat.decision, ApprovalDecision::DuplicateSource);
        assert_eq!(repeat.approval.sources_seen, vec!["cli"]);
        let events = bus.tail_events(5, None).unwrap();
        assert!(events.iter().any(|e| e.message == "approval.duplicate_source"));
    }

    #[test]
    fn strict_mode_requires_distinct_actors() {
        let (ledger, _, _, _dir) = ledger(true);
        ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", Some("ops:1"))
            .unwrap();
        let same_actor = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "chat", Some("ops:1"))
            .unwrap();
        assert_eq!(same_actor.decision, ApprovalDecision::DuplicateSource);
        let other_actor = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "chat", Some("ops:2"))
            .unwrap();
        assert_eq!(other_actor.decision, ApprovalDecision::Fulfilled);
    }

    #[test]
    fn window_boundary_fulfills_just_in_time() {
        let (ledger, _, clock, _dir) = ledger(false);
        ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", None)
            .unwrap();
        clock.advance(89);
        let offer = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "chat", None)
            .unwrap();
        assert_eq!(offer.decision, ApprovalDecision::Fulfilled);
    }

    #[test]
    fn window_lapse_expires_exactly_once() {
        let (ledger, bus, clock, _dir) = ledger(false);
        ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", None)
            .unwrap();
        clock.advance(91);
        let lapsed = ledger.sweep().unwrap();
        assert_eq!(lapsed.len(), 1);
        assert!(ledger.sweep().unwrap().is_empty(), "terminal records skipped");
        let events = bus.tail_events(10, None).unwrap();
        let expired: Vec<_> = events
            .iter()
            .filter(|e| e.message == "approval.expired")
            .collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].fields["identity"], "ABC123");
    }

    #[test]
    fn offer_after_expiry_starts_fresh() {
        let (ledger, _, clock, _dir) = ledger(false);
        ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "cli", None)
            .unwrap();
        clock.advance(91);
        let lapsed_offer = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "chat", None)
            .unwrap();
        assert_eq!(lapsed_offer.decision, ApprovalDecision::Expired);
        let fresh = ledger
            .offer("orders.confirm", "ABC123", Risk::High, 2, 90, "chat", None)
            .unwrap();
        assert_eq!(fresh.decision, ApprovalDecision::Pending);
        assert_eq!(fresh.approval.sources_seen, vec!["chat"]);
    }

    #[test]
    fn single_required_fulfills_immediately() {
        let (ledger, _, _, _dir) = ledger(false);
        let offer = ledger
            .offer("stop.now", "stop.now", Risk::Critical, 1, 5, "cli", None)
            .unwrap();
        assert_eq!(offer.decision, ApprovalDecision::Fulfilled);
    }
}
