//! Order ticket lifecycle.
//!
//! Every ticket passes through a deterministic set of states; transitions
//! are guarded and illegal ones are rejected with an error.
//!
//! State Diagram:
//! ```text
//!   PENDING ──────→ CONFIRMED_CHAT ──→ CONFIRMED ──→ FILLED
//!      │                  │                │
//!      ├→ CONFIRMED       ├→ CANCELED      └→ CANCELED
//!      ├→ REJECTED        └→ EXPIRED
//!      ├→ CANCELED
//!      └→ EXPIRED
//!
//!   Terminal states: REJECTED, CANCELED, EXPIRED, FILLED
//! ```

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Awaiting confirmation
    Pending,
    /// Confirmed through the chat channel only (partial dual-control)
    ConfirmedChat,
    /// Fully confirmed
    Confirmed,
    /// Rejected by an operator — terminal
    Rejected,
    /// Canceled (operator, kill-switch) — terminal
    Canceled,
    /// Confirmation window lapsed — terminal
    Expired,
    /// Executed by an external flow — terminal
    Filled,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Canceled | Self::Expired | Self::Filled
        )
    }

    /// Returns the set of states reachable from this state.
    pub fn valid_transitions(&self) -> &'static [OrderState] {
        use OrderState::*;
        match self {
            Pending => &[ConfirmedChat, Confirmed, Rejected, Canceled, Expired],
            ConfirmedChat => &[Confirmed, Canceled, Expired],
            Confirmed => &[Filled, Canceled],
            Rejected => &[],
            Canceled => &[],
            Expired => &[],
            Filled => &[],
        }
    }

    pub fn can_transition_to(&self, next: &OrderState) -> bool {
        self.valid_transitions().contains(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::ConfirmedChat => "CONFIRMED_CHAT",
            Self::Confirmed => "CONFIRMED",
            Self::Rejected => "REJECTED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Filled => "FILLED",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "LIMIT")]
    Limit,
    #[serde(rename = "STOP")]
    Stop,
}

#[derive(Error, Debug)]
#[error("illegal order transition for {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: OrderState,
    pub to: OrderState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTicket {
    pub id: String,
    /// Short human token, unique among active tickets.
    #[serde(default)]
    pub token: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Latest actor that touched the ticket, per source channel.
    #[serde(default)]
    pub last_actor_by_source: BTreeMap<String, String>,
    pub checksum: String,
}

impl OrderTicket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        side: Side,
        qty: Decimal,
        order_type: OrderType,
        limit_price: Option<Decimal>,
        stop_price: Option<Decimal>,
        ttl_sec: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let expires_at = ttl_sec.map(|ttl| now + Duration::seconds(ttl.max(0)));
        let payload = json!({
            "id": id.clone(),
            "symbol": symbol.to_ascii_uppercase(),
            "side": side,
            "qty": qty,
            "type": order_type,
            "limit_price": limit_price,
            "stop_price": stop_price,
            "created_at": now.to_rfc3339(),
        });
        let checksum = hex::encode(Sha256::digest(payload.to_string().as_bytes()));
        Self {
            id,
            token: String::new(),
            symbol: symbol.to_ascii_uppercase(),
            side,
            qty,
            order_type,
            limit_price,
            stop_price,
            state: OrderState::Pending,
            created_at: now,
            expires_at,
            last_actor_by_source: BTreeMap::new(),
            checksum,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Attempt a guarded state transition.
    pub fn transition(&mut self, next: OrderState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(&next) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        info!(
            order_id = %self.id,
            token = %self.token,
            from = %self.state,
            to = %next,
            "order transition"
        );
        self.state = next;
        Ok(())
    }

    pub fn record_actor(&mut self, source: &str, actor: &str) {
        self.last_actor_by_source
            .insert(source.to_string(), actor.to_string());
    }
}
