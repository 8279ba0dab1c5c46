//! Read-only snapshot for dashboards and operational menus.
//!
//! Never mutates; tolerates concurrent worker writes through the storage
//! layer's snapshot reads.

use crate::approvals::ApprovalLedger;
use crate::bus::{BusStore, Event};
use crate::orders::{OrderStore, OrderTicket};
use crate::persistence::redb_store::StoreError;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_EVENT_TAIL: usize = 200;
const KPI_WINDOW_SEC: i64 = 300;

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalsAggregate {
    pub count: usize,
    pub max_age_sec: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketLite {
    pub token: String,
    pub symbol: String,
    pub side: String,
    pub qty: String,
    pub state: String,
}

impl From<&OrderTicket> for TicketLite {
    fn from(t: &OrderTicket) -> Self {
        Self {
            token: t.token.clone(),
            symbol: t.symbol.clone(),
            side: format!("{:?}", t.side).to_ascii_uppercase(),
            qty: t.qty.to_string(),
            state: t.state.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrdersView {
    pub counts: BTreeMap<String, usize>,
    pub pending: Vec<TicketLite>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionView {
    pub chat_enabled: bool,
    pub bot_username: Option<String>,
    pub last_ok_ts: Option<String>,
    pub last_err: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Kpis {
    pub events_per_min: f64,
    pub commands_new: usize,
    pub commands_done: usize,
    pub commands_error: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub ts: String,
    pub mode: String,
    pub state: String,
    pub breaker_state: String,
    pub worker_start_ts: Option<String>,
    pub events: Vec<Event>,
    pub approvals: ApprovalsAggregate,
    pub orders: OrdersView,
    pub connection: ConnectionView,
    pub kpis: Kpis,
}

pub fn snapshot(
    bus: &BusStore,
    orders: &OrderStore,
    approvals: &ApprovalLedger,
    event_limit: usize,
) -> Result<Snapshot, StoreError> {
    let clock = bus.clock();
    let now = clock.now_epoch();

    let pending = approvals.pending()?;
    let max_age_sec = pending.iter().map(|a| a.age_sec(now)).max().unwrap_or(0);

    let (commands_new, commands_done, commands_error) = bus.count_by_status()?;
    let recent_events = bus.events_since(now - KPI_WINDOW_SEC)?;
    let events_per_min = recent_events as f64 / (KPI_WINDOW_SEC as f64 / 60.0);

    let pending_tickets = orders.pending(10)?;

    Ok(Snapshot {
        ts: clock.iso_utc(),
        mode: bus.get_state("mode")?.unwrap_or_else(|| "unknown".into()),
        state: bus.get_state("state")?.unwrap_or_else(|| "unknown".into()),
        breaker_state: bus
            .get_state("breaker_state")?
            .unwrap_or_else(|| "ok".into()),
        worker_start_ts: bus.get_state("worker_start_ts")?,
        events: bus.tail_events(event_limit, None)?,
        approvals: ApprovalsAggregate {
            count: pending.len(),
            max_age_sec,
        },
        orders: OrdersView {
            counts: orders.counts()?,
            pending: pending_tickets.iter().map(TicketLite::from).collect(),
        },
        connection: ConnectionView {
            chat_enabled: bus.get_state("chat.enabled")?.as_deref() == Some("1"),
            bot_username: bus.get_state("chat.bot_username")?,
            last_ok_ts: bus.get_state("chat.last_ok_ts")?,
            last_err: bus.get_state("chat.last_err")?,
        },
        kpis: Kpis {
            events_per_min,
            commands_new,
            commands_done,
            commands_error,
        },
    })
}
