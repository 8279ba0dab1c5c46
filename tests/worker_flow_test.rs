//! End-to-end worker scenarios: pause/resume round trip, dual-control
//! confirmation, duplicate-source rejection, unknown tokens, bulk confirm.

use marketlab_control_rs::approvals::ApprovalLedger;
use marketlab_control_rs::bus::{BusStore, CommandStatus, EnqueueRequest, Event, Source};
use marketlab_control_rs::clock::{Clock, ManualClock};
use marketlab_control_rs::orders::{OrderState, OrderStore, OrderTicket, OrderType, Side};
use marketlab_control_rs::persistence::redb_store::RedbStore;
use marketlab_control_rs::worker::{Worker, WorkerConfig};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    bus: BusStore,
    orders: OrderStore,
    approvals: ApprovalLedger,
    worker: Worker,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

fn harness(strict: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(100_000));
    let store = Arc::new(RedbStore::open(dir.path().join("ctl.db")).unwrap());
    let bus = BusStore::new(store.clone(), clock.clone()).unwrap();
    let orders = OrderStore::new(store, clock.clone(), 6).unwrap();
    let approvals = ApprovalLedger::new(bus.clone(), strict).unwrap();
    let worker = Worker::new(
        bus.clone(),
        orders.clone(),
        approvals.clone(),
        WorkerConfig::default(),
    )
    .unwrap();
    Harness {
        bus,
        orders,
        approvals,
        worker,
        clock,
        _dir: dir,
    }
}

fn seed_ticket(h: &Harness, token: &str) -> OrderTicket {
    let mut ticket = OrderTicket::new(
        "AAPL",
        Side::Buy,
        dec!(10),
        OrderType::Market,
        None,
        None,
        None,
        h.clock.now_utc(),
    );
    ticket.token = token.to_string();
    h.orders.put(ticket).unwrap()
}

fn events(h: &Harness) -> Vec<Event> {
    h.bus.tail_events(50, None).unwrap()
}

fn has_event(h: &Harness, message: &str) -> bool {
    events(h).iter().any(|e| e.message == message)
}

#[test]
fn pause_resume_round_trip() {
    let mut h = harness(false);
    h.bus
        .enqueue(EnqueueRequest::new("state.pause", Source::Cli))
        .unwrap();
    assert_eq!(h.worker.process_available(None).unwrap(), 1);
    assert_eq!(h.bus.get_state("state").unwrap().as_deref(), Some("PAUSED"));
    let tail = events(&h);
    let changed = tail.iter().find(|e| e.message == "state.changed").unwrap();
    assert_eq!(changed.fields["state"], "PAUSED");

    h.bus
        .enqueue(EnqueueRequest::new("state.resume", Source::Cli))
        .unwrap();
    assert_eq!(h.worker.process_available(None).unwrap(), 1);
    assert_eq!(h.bus.get_state("state").unwrap().as_deref(), Some("RUN"));
}

#[test]
fn dual_control_confirm_needs_two_sources() {
    let mut h = harness(false);
    seed_ticket(&h, "ABC123");

    h.bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Cli)
                .args(json!({"token": "ABC123"}))
                .actor("cli:1"),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());

    let pending = events(&h)
        .into_iter()
        .find(|e| e.message == "orders.confirm.pending")
        .expect("pending event");
    assert_eq!(pending.fields["token"], "ABC123");
    assert_eq!(pending.fields["sources"], json!(["cli"]));
    let ticket = h.orders.resolve_by_token("ABC123").unwrap().unwrap();
    assert_eq!(ticket.state, OrderState::Pending);

    h.bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Chat)
                .args(json!({"token": "ABC123"}))
                .actor("chat:42"),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());

    let ok = events(&h)
        .into_iter()
        .find(|e| e.message == "orders.confirm.ok")
        .expect("ok event");
    assert_eq!(ok.fields["token"], "ABC123");
    let sources: Vec<String> =
        serde_json::from_value(ok.fields["sources"].clone()).unwrap();
    assert_eq!(sources.len(), 2);
    assert!(sources.contains(&"cli".to_string()));
    assert!(sources.contains(&"chat".to_string()));
    let ticket = h.orders.resolve_by_token("ABC123").unwrap().unwrap();
    assert_eq!(ticket.state, OrderState::Confirmed);
    assert!(has_event(&h, "approval.fulfilled"));
}

#[test]
fn duplicate_source_is_rejected_under_strict_mode() {
    let mut h = harness(true);
    seed_ticket(&h, "ABC123");

    for actor in ["cli:1", "cli:2"] {
        h.bus
            .enqueue(
                EnqueueRequest::new("orders.confirm", Source::Cli)
                    .args(json!({"token": "ABC123"}))
                    .actor(actor),
            )
            .unwrap();
        assert!(h.worker.process_one().unwrap());
    }

    assert!(has_event(&h, "approval.duplicate_source"));
    assert!(!has_event(&h, "approval.fulfilled"));
    assert!(!has_event(&h, "orders.confirm.ok"));
    let ticket = h.orders.resolve_by_token("ABC123").unwrap().unwrap();
    assert_eq!(ticket.state, OrderState::Pending);
}

#[test]
fn chat_first_offer_marks_ticket_confirmed_chat() {
    let mut h = harness(false);
    seed_ticket(&h, "ABC123");

    h.bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Chat)
                .args(json!({"token": "ABC123"}))
                .actor("chat:42"),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    let ticket = h.orders.resolve_by_token("ABC123").unwrap().unwrap();
    assert_eq!(ticket.state, OrderState::ConfirmedChat);

    h.bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Cli)
                .args(json!({"token": "ABC123"}))
                .actor("cli:1"),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    let ticket = h.orders.resolve_by_token("ABC123").unwrap().unwrap();
    assert_eq!(ticket.state, OrderState::Confirmed);
}

#[test]
fn unknown_token_rejects_without_creating_approval() {
    let mut h = harness(false);
    let id = h
        .bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Cli)
                .args(json!({"token": "ZZZZ99"}))
                .actor("cli:1"),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());

    assert!(has_event(&h, "orders.confirm.unknown"));
    let rejected = events(&h)
        .into_iter()
        .find(|e| e.message == "command.rejected")
        .expect("rejected event");
    assert_eq!(rejected.fields["reason"], "unknown_token");
    let cmd = h.bus.get_command(&id).unwrap().unwrap();
    assert_eq!(cmd.status, CommandStatus::Error);
    assert!(h.approvals.get("orders.confirm", "ZZZZ99").unwrap().is_none());
}

#[test]
fn terminal_ticket_counts_as_unknown() {
    let mut h = harness(false);
    let ticket = seed_ticket(&h, "ABC123");
    h.orders
        .set_state(&ticket.id, OrderState::Canceled, Some("operator"), None)
        .unwrap();

    h.bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Cli)
                .args(json!({"token": "ABC123"}))
                .actor("cli:1"),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    assert!(has_event(&h, "orders.confirm.unknown"));
}

#[test]
fn confirm_all_is_one_bulk_approval_with_per_token_events() {
    let mut h = harness(false);
    seed_ticket(&h, "TOK001");
    seed_ticket(&h, "TOK002");

    h.bus
        .enqueue(EnqueueRequest::new("orders.confirm_all", Source::Cli).actor("cli:1"))
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    assert!(has_event(&h, "approval.pending"));

    h.bus
        .enqueue(EnqueueRequest::new("orders.confirm_all", Source::Chat).actor("chat:42"))
        .unwrap();
    assert!(h.worker.process_one().unwrap());

    let ok_tokens: Vec<String> = events(&h)
        .into_iter()
        .filter(|e| e.message == "orders.confirm.ok")
        .map(|e| e.fields["token"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ok_tokens.len(), 2);
    assert!(ok_tokens.contains(&"TOK001".to_string()));
    assert!(ok_tokens.contains(&"TOK002".to_string()));
    assert!(has_event(&h, "orders.confirm_all.ok"));
    for token in ["TOK001", "TOK002"] {
        let ticket = h.orders.resolve_by_token(token).unwrap().unwrap();
        assert_eq!(ticket.state, OrderState::Confirmed);
    }
}

#[test]
fn reject_flow_moves_ticket_to_rejected() {
    let mut h = harness(false);
    seed_ticket(&h, "ABC123");
    for (source, actor) in [(Source::Cli, "cli:1"), (Source::Chat, "chat:42")] {
        h.bus
            .enqueue(
                EnqueueRequest::new("orders.reject", source)
                    .args(json!({"token": "ABC123"}))
                    .actor(actor),
            )
            .unwrap();
        assert!(h.worker.process_one().unwrap());
    }
    assert!(has_event(&h, "orders.reject.ok"));
    let ticket = h.orders.resolve_by_token("ABC123").unwrap().unwrap();
    assert_eq!(ticket.state, OrderState::Rejected);
}

#[test]
fn mode_switch_validates_target() {
    let mut h = harness(false);
    h.bus
        .enqueue(
            EnqueueRequest::new("mode.switch", Source::Cli).args(json!({"target": "paper"})),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    assert_eq!(h.bus.get_state("mode").unwrap().as_deref(), Some("paper"));
    assert!(has_event(&h, "mode.changed"));

    let id = h
        .bus
        .enqueue(
            EnqueueRequest::new("mode.switch", Source::Cli).args(json!({"target": "warp"})),
        )
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    let cmd = h.bus.get_command(&id).unwrap().unwrap();
    assert_eq!(cmd.status, CommandStatus::Error);
    let rejected = events(&h)
        .into_iter()
        .find(|e| e.message == "command.rejected")
        .unwrap();
    assert_eq!(rejected.fields["reason"], "args_invalid");
    // mode unchanged
    assert_eq!(h.bus.get_state("mode").unwrap().as_deref(), Some("paper"));
}

#[test]
fn unknown_command_is_rejected_not_crashed() {
    let mut h = harness(false);
    let id = h
        .bus
        .enqueue(EnqueueRequest::new("diag.report", Source::Cli))
        .unwrap();
    assert!(h.worker.process_one().unwrap());
    let cmd = h.bus.get_command(&id).unwrap().unwrap();
    assert_eq!(cmd.status, CommandStatus::Error);
    let rejected = events(&h)
        .into_iter()
        .find(|e| e.message == "command.rejected")
        .unwrap();
    assert_eq!(rejected.fields["reason"], "unknown_command");
}

#[test]
fn duplicate_button_press_collapses_via_dedupe() {
    let mut h = harness(false);
    seed_ticket(&h, "ABC123");
    let key = "orders.confirm:ABC123:chat:42";
    let first = h
        .bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Chat)
                .args(json!({"token": "ABC123"}))
                .actor("chat:42")
                .dedupe_key(key),
        )
        .unwrap();
    let second = h
        .bus
        .enqueue(
            EnqueueRequest::new("orders.confirm", Source::Chat)
                .args(json!({"token": "ABC123"}))
                .actor("chat:42")
                .dedupe_key(key),
        )
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.worker.process_available(None).unwrap(), 1);
}
