//! Command worker: dequeue, classify, enforce dual-control, execute, emit.
//!
//! The worker is the sole writer of command status transitions, app state,
//! approvals and order tickets. Handlers are synchronous and store-bound;
//! they never touch the network. Unexpected handler failures feed the
//! circuit breaker; policy and business rejections do not.

use crate::approvals::{ApprovalDecision, ApprovalLedger, Offer};
use crate::bus::{BusStore, Command, EventLevel, Source};
use crate::circuit_breaker::{BreakerState, ErrorWindow};
use crate::clock::Clock;
use crate::config::Settings;
use crate::metrics;
use crate::orders::{OrderError, OrderState, OrderStore, OrderTicket};
use crate::persistence::redb_store::StoreError;
use crate::policy::{classify, identity_for, CommandPolicy, Risk};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

const HEARTBEAT_EVERY_SEC: i64 = 2;
const SWEEP_EVERY_SEC: i64 = 5;

const VALID_MODES: [&str; 5] = ["paper", "live", "backtest", "replay", "control"];

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Known rejection. The command is marked ERROR with the reason, a
    /// `command.rejected` event is recorded, and the breaker is untouched.
    #[error("rejected: {reason}")]
    Rejected { reason: String },
    /// Unexpected failure. Counts toward the circuit breaker.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl HandlerError {
    fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        Self::Unexpected(e.to_string())
    }
}

impl From<OrderError> for HandlerError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::Unknown(_) => Self::rejected("unknown_token"),
            // A ticket in the wrong state is a business rejection, not a
            // fault worth a breaker count.
            OrderError::Transition(_) => Self::rejected("invalid_transition"),
            OrderError::Store(e) => Self::Unexpected(e.to_string()),
        }
    }
}

pub type HandlerFn = Box<dyn Fn(&Command) -> Result<(), HandlerError> + Send>;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Enforce the two-man rule for HIGH commands.
    pub dual_control: bool,
    pub breaker_threshold: usize,
    pub breaker_window_sec: i64,
    /// Window applied to HIGH-risk approvals; other risk classes keep the
    /// per-command policy window.
    pub approval_window_sec: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dual_control: true,
            breaker_threshold: 5,
            breaker_window_sec: 60,
            approval_window_sec: 90,
        }
    }
}

impl WorkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            dual_control: true,
            breaker_threshold: settings.breaker_threshold,
            breaker_window_sec: settings.breaker_window_sec,
            approval_window_sec: settings.approval_window_sec,
        }
    }
}

enum Enforcement {
    /// Execute with the approving sources.
    Approved(Vec<String>),
    /// Approval registered but not fulfilled; the command is done.
    Held,
}

pub struct Worker {
    bus: BusStore,
    orders: OrderStore,
    approvals: ApprovalLedger,
    clock: Arc<dyn Clock>,
    cfg: WorkerConfig,
    window: ErrorWindow,
    breaker: BreakerState,
    last_sweep: i64,
    last_heartbeat: i64,
    extra_handlers: HashMap<String, HandlerFn>,
}

impl Worker {
    pub fn new(
        bus: BusStore,
        orders: OrderStore,
        approvals: ApprovalLedger,
        cfg: WorkerConfig,
    ) -> Result<Self, StoreError> {
        let clock = bus.clock();
        let breaker = bus
            .get_state("breaker_state")?
            .and_then(|s| s.parse().ok())
            .unwrap_or(BreakerState::Ok);
        if breaker == BreakerState::Ok {
            bus.set_state("breaker_state", BreakerState::Ok.as_str())?;
        }
        let window = ErrorWindow::new(cfg.breaker_threshold, cfg.breaker_window_sec);
        Ok(Self {
            bus,
            orders,
            approvals,
            clock,
            cfg,
            window,
            breaker,
            last_sweep: 0,
            last_heartbeat: 0,
            extra_handlers: HashMap::new(),
        })
    }

    /// Route a command name to a custom handler ahead of the built-ins.
    /// Extension point for modes and tests.
    pub fn register_handler(&mut self, cmd: &str, handler: HandlerFn) {
        self.extra_handlers.insert(cmd.to_string(), handler);
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker
    }

    /// Announce startup: liveness keys, run state, `worker.start` event.
    pub fn startup(&self, pid: u32) -> Result<(), StoreError> {
        self.bus.set_state("worker_start_ts", &self.clock.iso_utc())?;
        self.bus
            .set_state("worker_heartbeat_ts", &self.clock.now_epoch().to_string())?;
        if self.breaker == BreakerState::Ok {
            self.bus.set_state("state", "RUN")?;
        }
        self.bus.emit(EventLevel::Info, "worker.start", json!({
            "pid": pid,
            "breaker": self.breaker.as_str(),
        }))?;
        Ok(())
    }

    /// Process the oldest eligible command. Returns false when the queue is
    /// empty or the breaker is holding everything back.
    pub fn process_one(&mut self) -> Result<bool, StoreError> {
        let now = self.clock.now_epoch();
        self.heartbeat(now)?;
        self.sweep_if_due(now)?;

        let next = if self.breaker == BreakerState::Tripped {
            // Only an explicit resume is allowed through a tripped breaker.
            self.bus.next_new_named("state.resume")?
        } else {
            self.bus.next_new()?
        };
        let Some(cmd) = next else {
            return Ok(false);
        };
        self.run_command(&cmd)?;
        Ok(true)
    }

    /// Drain available NEW commands. Returns the number processed.
    pub fn process_available(&mut self, max_items: Option<usize>) -> Result<usize, StoreError> {
        let mut n = 0;
        loop {
            if let Some(max) = max_items {
                if n >= max {
                    break;
                }
            }
            if !self.process_one()? {
                break;
            }
            n += 1;
        }
        Ok(n)
    }

    pub async fn run_forever(&mut self, poll_interval: std::time::Duration) -> Result<(), StoreError> {
        loop {
            let processed = self.process_available(None)?;
            if processed == 0 {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    fn run_command(&mut self, cmd: &Command) -> Result<(), StoreError> {
        match self.dispatch(cmd) {
            Ok(()) => {
                metrics::COMMANDS_DONE.inc();
                self.bus.mark_done(&cmd.cmd_id)?;
            }
            Err(HandlerError::Rejected { reason }) => {
                metrics::COMMANDS_REJECTED.inc();
                warn!(cmd = %cmd.cmd, cmd_id = %cmd.cmd_id, reason = %reason, "command rejected");
                self.bus.emit(EventLevel::Warn, "command.rejected", json!({
                    "cmd_id": cmd.cmd_id.clone(),
                    "cmd": cmd.cmd.clone(),
                    "source": cmd.source.as_str(),
                    "reason": reason.clone(),
                }))?;
                self.bus.mark_error(&cmd.cmd_id, &reason, None)?;
            }
            Err(HandlerError::Unexpected(msg)) => {
                metrics::COMMANDS_FAILED.inc();
                error!(cmd = %cmd.cmd, cmd_id = %cmd.cmd_id, "handler failed: {}", msg);
                self.bus.mark_error(&cmd.cmd_id, &msg, None)?;
                self.record_failure(cmd, &msg)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, cmd: &Command) -> Result<(), HandlerError> {
        if let Some(handler) = self.extra_handlers.get(&cmd.cmd) {
            return handler(cmd);
        }
        let policy = classify(&cmd.cmd);
        let approvers = match self.enforce_policy(cmd, &policy)? {
            Enforcement::Approved(sources) => sources,
            Enforcement::Held => return Ok(()),
        };
        match cmd.cmd.as_str() {
            "state.pause" => self.handle_state_change(cmd, "PAUSED"),
            "state.resume" => self.handle_resume(cmd),
            "state.stop" => self.handle_state_change(cmd, "STOPPED"),
            "mode.switch" => self.handle_mode_switch(cmd),
            "stop.now" => self.handle_stop_now(cmd, &approvers),
            "orders.confirm" => self.handle_order_transition(
                cmd,
                &approvers,
                OrderState::Confirmed,
                "orders.confirm",
            ),
            "orders.reject" => self.handle_order_transition(
                cmd,
                &approvers,
                OrderState::Rejected,
                "orders.reject",
            ),
            "orders.cancel" => self.handle_order_transition(
                cmd,
                &approvers,
                OrderState::Canceled,
                "orders.cancel",
            ),
            "live.cancel" => self.handle_order_transition(
                cmd,
                &approvers,
                OrderState::Canceled,
                "live.cancel",
            ),
            "orders.confirm_all" => self.handle_confirm_all(cmd, &approvers),
            _ => Err(HandlerError::rejected("unknown_command")),
        }
    }

    fn enforce_policy(
        &mut self,
        cmd: &Command,
        policy: &CommandPolicy,
    ) -> Result<Enforcement, HandlerError> {
        let source = cmd.source.as_str().to_string();
        if !self.cfg.dual_control || policy.required_approvals <= 1 {
            return Ok(Enforcement::Approved(vec![source]));
        }

        // Unknown or terminal tickets never open an approval.
        if ticket_command(&cmd.cmd) {
            self.resolve_active_ticket(cmd)?;
        }

        let identity = identity_for(&cmd.cmd, &cmd.args);
        let window = if policy.risk == Risk::High {
            self.cfg.approval_window_sec
        } else {
            policy.approval_window_sec
        };
        let offer = self.approvals.offer(
            &cmd.cmd,
            &identity,
            policy.risk,
            policy.required_approvals,
            window,
            &source,
            cmd.actor_id.as_deref(),
        )?;
        match offer.decision {
            ApprovalDecision::Fulfilled => {
                let mut sources = offer.approval.sources_seen.clone();
                sources.sort();
                Ok(Enforcement::Approved(sources))
            }
            ApprovalDecision::Pending => {
                self.on_pending_approval(cmd, &identity, &offer)?;
                Ok(Enforcement::Held)
            }
            ApprovalDecision::DuplicateSource => Ok(Enforcement::Held),
            ApprovalDecision::Expired => Ok(Enforcement::Held),
        }
    }

    /// First-offer side effects: the pending event, and the partial chat
    /// confirmation marker on the ticket.
    fn on_pending_approval(
        &mut self,
        cmd: &Command,
        identity: &str,
        offer: &Offer,
    ) -> Result<(), HandlerError> {
        if cmd.cmd != "orders.confirm" {
            return Ok(());
        }
        let mut sources = offer.approval.sources_seen.clone();
        sources.sort();
        self.bus.emit(EventLevel::Warn, "orders.confirm.pending", json!({
            "token": identity,
            "sources": sources,
        }))?;
        if cmd.source == Source::Chat {
            if let Some(ticket) = self.orders.resolve_by_token(identity)? {
                if ticket.state == OrderState::Pending {
                    self.orders.set_state(
                        &ticket.id,
                        OrderState::ConfirmedChat,
                        Some("chat_confirm"),
                        Some((cmd.source.as_str(), cmd.actor_id.as_deref().unwrap_or("chat:unknown"))),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn resolve_active_ticket(&mut self, cmd: &Command) -> Result<OrderTicket, HandlerError> {
        let token = cmd
            .args
            .get("token")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| HandlerError::rejected("args_invalid"))?;
        let ticket = self.orders.resolve_by_token(token)?;
        match ticket {
            Some(t) if !t.is_terminal() => Ok(t),
            _ => {
                self.bus
                    .emit(EventLevel::Error, &format!("{}.unknown", cmd.cmd), json!({
                        "token": token.to_ascii_uppercase(),
                        "source": cmd.source.as_str(),
                    }))?;
                Err(HandlerError::rejected("unknown_token"))
            }
        }
    }

    // --- handlers ---

    fn handle_state_change(&mut self, cmd: &Command, state: &str) -> Result<(), HandlerError> {
        // Idempotent: re-applying the current state re-emits it.
        self.bus.set_state("state", state)?;
        self.bus.emit(EventLevel::Ok, "state.changed", json!({
            "state": state,
            "source": cmd.source.as_str(),
        }))?;
        Ok(())
    }

    fn handle_resume(&mut self, cmd: &Command) -> Result<(), HandlerError> {
        self.bus.set_state("state", "RUN")?;
        self.bus.emit(EventLevel::Ok, "state.changed", json!({
            "state": "RUN",
            "source": cmd.source.as_str(),
        }))?;
        if self.breaker != BreakerState::Ok {
            self.breaker = BreakerState::Ok;
            self.window.clear();
            self.bus.set_state("breaker_state", BreakerState::Ok.as_str())?;
            self.bus.emit(EventLevel::Info, "breaker.reset", json!({
                "source": cmd.source.as_str(),
            }))?;
            info!("breaker reset by {}", cmd.source.as_str());
        }
        Ok(())
    }

    fn handle_mode_switch(&mut self, cmd: &Command) -> Result<(), HandlerError> {
        let target = cmd
            .args
            .get("target")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if !VALID_MODES.contains(&target) {
            return Err(HandlerError::rejected("args_invalid"));
        }
        self.bus.set_state("mode", target)?;
        self.bus.emit(EventLevel::Info, "mode.changed", json!({
            "mode": target,
            "source": cmd.source.as_str(),
        }))?;
        Ok(())
    }

    fn handle_order_transition(
        &mut self,
        cmd: &Command,
        approvers: &[String],
        next: OrderState,
        event_prefix: &str,
    ) -> Result<(), HandlerError> {
        let ticket = self.resolve_active_ticket(cmd)?;
        let actor = cmd.actor_id.clone().unwrap_or_else(|| cmd.source.as_str().to_string());
        self.orders.set_state(
            &ticket.id,
            next,
            Some(event_prefix),
            Some((cmd.source.as_str(), actor.as_str())),
        )?;
        let sources = self.sources_with(cmd, approvers);
        self.bus
            .emit(EventLevel::Ok, &format!("{event_prefix}.ok"), json!({
                "token": ticket.token,
                "sources": sources,
            }))?;
        Ok(())
    }

    fn handle_confirm_all(&mut self, cmd: &Command, approvers: &[String]) -> Result<(), HandlerError> {
        let sources = self.sources_with(cmd, approvers);
        let pending = self.orders.pending(usize::MAX - 1)?;
        let mut confirmed = 0usize;
        for ticket in pending {
            self.orders.set_state(
                &ticket.id,
                OrderState::Confirmed,
                Some("orders.confirm_all"),
                Some((cmd.source.as_str(), cmd.actor_id.as_deref().unwrap_or("?"))),
            )?;
            self.bus.emit(EventLevel::Ok, "orders.confirm.ok", json!({
                "token": ticket.token,
                "sources": sources.clone(),
            }))?;
            confirmed += 1;
        }
        self.bus.emit(EventLevel::Ok, "orders.confirm_all.ok", json!({
            "count": confirmed,
            "sources": sources,
        }))?;
        Ok(())
    }

    fn handle_stop_now(&mut self, cmd: &Command, approvers: &[String]) -> Result<(), HandlerError> {
        self.bus.set_state("state", "PAUSED")?;
        let canceled = self.orders.cancel_active("killswitch")?;
        self.breaker = BreakerState::Killswitch;
        self.window.clear();
        self.bus
            .set_state("breaker_state", BreakerState::Killswitch.as_str())?;
        let sources = self.sources_with(cmd, approvers);
        warn!("kill-switch engaged by {:?}, {} tickets canceled", sources, canceled.len());
        self.bus.emit(EventLevel::Error, "stop.now", json!({
            "sources": sources,
            "canceled": canceled.len(),
            "tokens": canceled,
        }))?;
        Ok(())
    }

    // --- breaker & housekeeping ---

    fn record_failure(&mut self, cmd: &Command, msg: &str) -> Result<(), StoreError> {
        if self.breaker != BreakerState::Ok {
            return Ok(());
        }
        let now = self.clock.now_epoch();
        if self.window.record(now, &format!("{}: {}", cmd.cmd, msg)) {
            self.breaker = BreakerState::Tripped;
            metrics::BREAKER_TRIPS.inc();
            self.bus.set_state("state", "PAUSED")?;
            self.bus
                .set_state("breaker_state", BreakerState::Tripped.as_str())?;
            self.bus.emit(EventLevel::Error, "breaker.tripped", json!({
                "cmd": cmd.cmd.clone(),
                "cmd_id": cmd.cmd_id.clone(),
                "count": self.window.len(),
                "window_sec": self.cfg.breaker_window_sec,
                "recent_errors": self.window.recent(),
            }))?;
            error!(
                "breaker tripped after {} errors in {}s",
                self.window.len(),
                self.cfg.breaker_window_sec
            );
        }
        Ok(())
    }

    fn heartbeat(&mut self, now: i64) -> Result<(), StoreError> {
        if now - self.last_heartbeat >= HEARTBEAT_EVERY_SEC {
            self.bus.set_state("worker_heartbeat_ts", &now.to_string())?;
            self.last_heartbeat = now;
        }
        Ok(())
    }

    fn sweep_if_due(&mut self, now: i64) -> Result<(), StoreError> {
        if now - self.last_sweep < SWEEP_EVERY_SEC {
            return Ok(());
        }
        self.last_sweep = now;
        for lapsed in self.approvals.sweep()? {
            if lapsed.cmd_name == "orders.confirm" {
                self.bus.emit(EventLevel::Warn, "orders.confirm.expired", json!({
                    "token": lapsed.identity,
                }))?;
            }
        }
        match self.orders.expire_due() {
            Ok(expired) => {
                for token in expired {
                    self.bus
                        .emit(EventLevel::Warn, "orders.expired", json!({ "token": token }))?;
                }
            }
            Err(OrderError::Store(e)) => return Err(e),
            Err(e) => warn!("order expiry sweep failed: {}", e),
        }
        Ok(())
    }

    fn sources_with(&self, cmd: &Command, approvers: &[String]) -> Vec<String> {
        let mut set: Vec<String> = approvers.to_vec();
        let source = cmd.source.as_str().to_string();
        if !set.contains(&source) {
            set.push(source);
        }
        set.sort();
        set.dedup();
        set
    }
}

fn ticket_command(cmd: &str) -> bool {
    matches!(
        cmd,
        "orders.confirm" | "orders.reject" | "orders.cancel" | "live.cancel"
    )
}
