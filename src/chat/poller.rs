//! Chat ingress loop.
//!
//! One outstanding long-poll request at a time; each incoming message or
//! button callback runs the gauntlet allowlist -> rate limit -> PIN -> parse
//! and ends as a bus command with `source="chat"`. The loop never executes
//! commands itself.

use crate::bus::{stable_dedupe_key, BusStore, EnqueueRequest, EventLevel, Source, DEFAULT_TTL};
use crate::chat::auth::{Allowlist, PinSessions, RateLimiter, PIN_SESSION_TTL};
use crate::chat::menu;
use crate::chat::transport::{ChatTransport, Update};
use crate::clock::Clock;
use crate::config::Settings;
use crate::orders::OrderStore;
use crate::persistence::redb_store::StoreError;
use crate::policy::{classify, identity_for};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const MAX_BACKOFF_SEC: u64 = 30;

#[derive(Error, Debug)]
pub enum IngressError {
    #[error("chat config invalid: {0}")]
    Config(String),
    #[error("chat auth failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] crate::chat::transport::ChatError),
}

#[derive(Debug, Clone)]
pub struct ChatIngressConfig {
    pub control_channel: i64,
    pub allowlist: Vec<i64>,
    pub pin: Option<String>,
    pub rate_limit_per_min: usize,
    pub long_poll_sec: u64,
}

impl ChatIngressConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, IngressError> {
        if !settings.chat_enabled() {
            return Err(IngressError::Config("CHAT_ENABLED is not set".into()));
        }
        let control_channel = settings
            .chat_control_channel
            .ok_or_else(|| IngressError::Config("CHAT_CONTROL_CHANNEL missing".into()))?;
        Ok(Self {
            control_channel,
            allowlist: settings.chat_allowlist(),
            pin: settings.chat_pin().map(|p| p.to_string()),
            rate_limit_per_min: settings.chat_rate_limit_per_min,
            long_poll_sec: settings.chat_long_poll_sec,
        })
    }
}

pub struct ChatIngress<T: ChatTransport> {
    transport: T,
    bus: BusStore,
    orders: OrderStore,
    cfg: ChatIngressConfig,
    clock: Arc<dyn Clock>,
    allowlist: Allowlist,
    rate: RateLimiter,
    pins: PinSessions,
}

impl<T: ChatTransport> ChatIngress<T> {
    pub fn new(transport: T, bus: BusStore, orders: OrderStore, cfg: ChatIngressConfig) -> Self {
        let clock = bus.clock();
        let allowlist = Allowlist::new(cfg.allowlist.iter().copied());
        let rate = RateLimiter::new(cfg.rate_limit_per_min);
        Self {
            transport,
            bus,
            orders,
            cfg,
            clock,
            allowlist,
            rate,
            pins: PinSessions::new(),
        }
    }

    /// Probe the bot identity, post the control menu banner and publish the
    /// connection keys dashboards read.
    pub async fn startup(&self) -> Result<(), IngressError> {
        let identity = match self.transport.identity().await {
            Ok(identity) => identity,
            Err(e) if e.is_auth_failure() => {
                self.bus.set_state("chat.last_err", &e.to_string())?;
                self.bus
                    .emit(EventLevel::Error, "chat.error", json!({"stage": "identity"}))?;
                return Err(IngressError::Auth(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "chat bot ready: {} (id={})",
            identity.username.as_deref().unwrap_or("?"),
            identity.id
        );
        self.bus.set_state("chat.enabled", "1")?;
        self.bus
            .set_state("chat.bot_username", identity.username.as_deref().unwrap_or(""))?;
        self.bus
            .set_state("chat.allowlist_count", &self.allowlist.len().to_string())?;
        self.bus.set_state("chat.last_ok_ts", &self.clock.iso_utc())?;
        let keyboard = menu::build_main_menu(&self.orders)?;
        self.transport
            .send_message(self.cfg.control_channel, "MarketLab Control", Some(keyboard))
            .await?;
        Ok(())
    }

    /// Long-poll loop with persisted offset and capped exponential backoff.
    pub async fn run(&mut self) -> Result<(), IngressError> {
        let mut offset: Option<i64> = self
            .bus
            .get_state("chat.offset")?
            .and_then(|s| s.parse().ok());
        let mut backoff: u64 = 1;
        loop {
            match self
                .transport
                .get_updates(offset, self.cfg.long_poll_sec)
                .await
            {
                Ok(updates) => {
                    backoff = 1;
                    self.bus.set_state("chat.last_ok_ts", &self.clock.iso_utc())?;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Err(e) = self.handle_update(&update).await {
                            warn!("update {} failed: {}", update.update_id, e);
                        }
                        self.bus
                            .set_state("chat.offset", &update.update_id.saturating_add(1).to_string())?;
                    }
                }
                Err(e) => {
                    warn!("long poll failed: {}", e);
                    self.bus.set_state("chat.last_err", &e.to_string())?;
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SEC);
                }
            }
        }
    }

    pub async fn handle_update(&mut self, update: &Update) -> Result<(), IngressError> {
        if let Some(callback) = &update.callback_query {
            let data = callback.data.clone().unwrap_or_default();
            self.handle_callback(callback.from.id, &callback.id, &data)
                .await?;
            return Ok(());
        }
        if let Some(message) = &update.message {
            let Some(text) = message.text.clone() else {
                return Ok(());
            };
            let sender = message.from.as_ref().map(|u| u.id);
            self.handle_text(sender, message.chat.id, text.trim()).await?;
        }
        Ok(())
    }

    async fn handle_callback(
        &mut self,
        sender: i64,
        callback_id: &str,
        data: &str,
    ) -> Result<(), IngressError> {
        let Some(payload) = menu::decode(data) else {
            return Ok(());
        };
        if !self.allowlist.permits(Some(sender)) {
            self.emit_auth_denied(Some(sender))?;
            self.transport
                .answer_callback(callback_id, "access denied")
                .await?;
            return Ok(());
        }
        if !self.check_rate(sender).await? {
            self.transport
                .answer_callback(callback_id, "rate limit reached, slow down")
                .await?;
            return Ok(());
        }
        let Some((cmd, args)) = menu::command_for(&payload) else {
            self.transport
                .answer_callback(callback_id, "unknown action")
                .await?;
            return Ok(());
        };
        if !self.check_pin(&cmd, sender)? {
            self.transport
                .answer_callback(callback_id, "PIN required: send /pin <secret>")
                .await?;
            return Ok(());
        }
        self.enqueue_control(&cmd, args, sender)?;
        self.transport
            .answer_callback(callback_id, &format!("OK: {}", payload.action))
            .await?;
        // Re-render the menu so token buttons track the order book.
        let keyboard = menu::build_main_menu(&self.orders)?;
        self.transport
            .send_message(self.cfg.control_channel, "MarketLab Control", Some(keyboard))
            .await?;
        Ok(())
    }

    async fn handle_text(
        &mut self,
        sender: Option<i64>,
        chat_id: i64,
        text: &str,
    ) -> Result<(), IngressError> {
        if !self.allowlist.permits(sender) {
            self.emit_auth_denied(sender)?;
            self.transport
                .send_message(chat_id, "access denied", None)
                .await?;
            return Ok(());
        }
        let Some(sender) = sender else {
            return Ok(());
        };
        if let Some(rest) = text.strip_prefix("/pin") {
            return self.handle_pin(sender, chat_id, rest.trim()).await;
        }
        if !self.check_rate(sender).await? {
            self.transport
                .send_message(chat_id, "rate limit reached, slow down", None)
                .await?;
            return Ok(());
        }
        let Some((cmd, args)) = parse_text_command(text) else {
            return Ok(());
        };
        if !self.check_pin(&cmd, sender)? {
            self.transport
                .send_message(chat_id, "PIN required: send /pin <secret>", None)
                .await?;
            return Ok(());
        }
        self.enqueue_control(&cmd, args, sender)?;
        self.transport
            .send_message(chat_id, &format!("OK: {cmd}"), None)
            .await?;
        Ok(())
    }

    async fn handle_pin(
        &mut self,
        sender: i64,
        chat_id: i64,
        provided: &str,
    ) -> Result<(), IngressError> {
        let Some(expected) = self.cfg.pin.as_deref() else {
            self.transport
                .send_message(chat_id, "PIN is not enabled", None)
                .await?;
            return Ok(());
        };
        if provided == expected {
            self.pins.grant(sender, self.clock.now_epoch());
            self.transport
                .send_message(chat_id, &format!("PIN ok ({PIN_SESSION_TTL}s)"), None)
                .await?;
        } else {
            self.bus.emit(EventLevel::Warn, "auth.pin.rejected", json!({
                "actor_id": format!("chat:{sender}"),
            }))?;
            self.transport
                .send_message(chat_id, "PIN invalid", None)
                .await?;
        }
        Ok(())
    }

    /// Sliding rate limit; the `rate.limited` event itself is throttled to
    /// one per minute per user.
    async fn check_rate(&mut self, sender: i64) -> Result<bool, IngressError> {
        let now = self.clock.now_epoch();
        if self.rate.allow(sender, now) {
            return Ok(true);
        }
        if self.rate.should_emit_throttle(sender, now) {
            self.bus.emit(EventLevel::Warn, "rate.limited", json!({
                "actor_id": format!("chat:{sender}"),
            }))?;
        }
        Ok(false)
    }

    /// HIGH and CRITICAL commands require a valid PIN session when a PIN is
    /// configured.
    fn check_pin(&mut self, cmd: &str, sender: i64) -> Result<bool, IngressError> {
        if self.cfg.pin.is_none() || !classify(cmd).risk.is_elevated() {
            return Ok(true);
        }
        if self.pins.is_valid(sender, self.clock.now_epoch()) {
            return Ok(true);
        }
        self.bus.emit(EventLevel::Warn, "auth.pin.required", json!({
            "cmd": cmd,
            "actor_id": format!("chat:{sender}"),
        }))?;
        Ok(false)
    }

    fn emit_auth_denied(&self, sender: Option<i64>) -> Result<(), StoreError> {
        self.bus.emit(EventLevel::Warn, "auth.denied", json!({
            "actor_id": sender.map(|s| format!("chat:{s}")),
        }))?;
        Ok(())
    }

    /// Enqueue with chat attribution. High-risk commands get a
    /// `(cmd, identity, actor)` dedupe key so duplicate button presses
    /// collapse while a second approver still lands a distinct command.
    pub fn enqueue_control(
        &self,
        cmd: &str,
        args: Value,
        sender: i64,
    ) -> Result<String, StoreError> {
        let policy = classify(cmd);
        let actor = format!("chat:{sender}");
        let ttl = DEFAULT_TTL.max(policy.approval_window_sec + 30);
        let mut request = EnqueueRequest::new(cmd, Source::Chat)
            .args(args.clone())
            .ttl(Some(ttl))
            .actor(&actor);
        if policy.risk.is_elevated() {
            let identity = identity_for(cmd, &args);
            if identity == cmd {
                request = request.dedupe_key(&format!("{}:{}", stable_dedupe_key(cmd, &args), actor));
            } else {
                request = request.dedupe_key(&format!("{cmd}:{identity}:{actor}"));
            }
        }
        self.bus.enqueue(request)
    }
}

/// Textual command grammar.
pub fn parse_text_command(text: &str) -> Option<(String, Value)> {
    let text = text.trim();
    match text {
        "/pause" => return Some(("state.pause".into(), json!({}))),
        "/resume" => return Some(("state.resume".into(), json!({}))),
        "/stop" | "/stopnow" => return Some(("stop.now".into(), json!({}))),
        "/paper" => return Some(("mode.switch".into(), json!({"target": "paper"}))),
        "/live" => return Some(("mode.switch".into(), json!({"target": "live"}))),
        _ => {}
    }
    for (prefix, cmd) in [("/confirm ", "orders.confirm"), ("/reject ", "orders.reject")] {
        if let Some(rest) = text.strip_prefix(prefix) {
            let token = rest.trim();
            if (3..=10).contains(&token.len()) {
                return Some((cmd.into(), json!({"token": token})));
            }
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_covers_state_and_mode() {
        assert_eq!(parse_text_command("/pause").unwrap().0, "state.pause");
        assert_eq!(parse_text_command("/resume").unwrap().0, "state.resume");
        assert_eq!(parse_text_command("/stop").unwrap().0, "stop.now");
        let (cmd, args) = parse_text_command("/paper").unwrap();
        assert_eq!(cmd, "mode.switch");
        assert_eq!(args["target"], "paper");
        let (_, args) = parse_text_command("/live").unwrap();
        assert_eq!(args["target"], "live");
    }

    #[test]
    fn grammar_extracts_tokens() {
        let (cmd, args) = parse_text_command("/confirm ABC123").unwrap();
        assert_eq!(cmd, "orders.confirm");
        assert_eq!(args["token"], "ABC123");
        let (cmd, _) = parse_text_command("/reject ABC123").unwrap();
        assert_eq!(cmd, "orders.reject");
    }

    #[test]
    fn grammar_rejects_bad_tokens_and_noise() {
        assert!(parse_text_command("/confirm").is_none());
        assert!(parse_text_command("/confirm  ").is_none());
        assert!(parse_text_command("/confirm THISTOKENISWAYTOOLONG").is_none());
        assert!(parse_text_command("hello there").is_none());
    }
}
