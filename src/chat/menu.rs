//! Inline control menu and the button payload codec.
//!
//! Button payloads are opaque structured identifiers embedded at render
//! time: `action:<cmd>|identity:<value>`, bounded length.

use crate::orders::OrderStore;
use crate::persistence::redb_store::StoreError;
use serde_json::{json, Value};

/// Upper bound for an encoded payload; anything longer is dropped at decode.
pub const MAX_PAYLOAD_LEN: usize = 64;

const MENU_PENDING_LIMIT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonPayload {
    pub action: String,
    pub identity: Option<String>,
}

pub fn encode(action: &str, identity: Option<&str>) -> String {
    match identity {
        Some(identity) => format!("action:{action}|identity:{identity}"),
        None => format!("action:{action}"),
    }
}

pub fn decode(raw: &str) -> Option<ButtonPayload> {
    if raw.is_empty() || raw.len() > MAX_PAYLOAD_LEN {
        return None;
    }
    let mut action = None;
    let mut identity = None;
    for part in raw.split('|') {
        let (key, value) = part.split_once(':')?;
        match key {
            "action" => action = Some(value.to_string()),
            "identity" => identity = Some(value.to_string()),
            _ => return None,
        }
    }
    let action = action.filter(|a| !a.is_empty())?;
    Some(ButtonPayload { action, identity })
}

/// Map a decoded payload onto a bus command and its args.
pub fn command_for(payload: &ButtonPayload) -> Option<(String, Value)> {
    match payload.action.as_str() {
        "state.pause" | "state.resume" | "stop.now" | "orders.confirm_all" => {
            Some((payload.action.clone(), json!({})))
        }
        "mode.switch" => {
            let target = payload.identity.as_deref()?;
            Some(("mode.switch".into(), json!({ "target": target })))
        }
        "orders.confirm" | "orders.reject" | "orders.cancel" => {
            let token = payload.identity.as_deref()?;
            Some((payload.action.clone(), json!({ "token": token })))
        }
        _ => None,
    }
}

fn button(text: &str, action: &str, identity: Option<&str>) -> Value {
    json!({ "text": text, "callback_data": encode(action, identity) })
}

/// Inline keyboard with the static control row plus one confirm/reject row
/// per pending ticket.
pub fn build_main_menu(orders: &OrderStore) -> Result<Value, StoreError> {
    let mut rows = vec![
        vec![
            button("Pause", "state.pause", None),
            button("Resume", "state.resume", None),
            button("Stop", "stop.now", None),
        ],
        vec![
            button("Mode Paper", "mode.switch", Some("paper")),
            button("Mode Live", "mode.switch", Some("live")),
        ],
    ];
    for ticket in orders.pending(MENU_PENDING_LIMIT)? {
        rows.push(vec![
            button(
                &format!("Confirm {}", ticket.token),
                "orders.confirm",
                Some(&ticket.token),
            ),
            button(
                &format!("Reject {}", ticket.token),
                "orders.reject",
                Some(&ticket.token),
            ),
        ]);
    }
    Ok(json!({ "inline_keyboard": rows }))
}
