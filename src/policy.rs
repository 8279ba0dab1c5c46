//! Central risk matrix for command bus operations.
//!
//! The policy is static; it does not consult runtime state. Changing it
//! requires a redeploy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Risk {
    Low,
    High,
    Critical,
}

impl Risk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Risk::Low => "LOW",
            Risk::High => "HIGH",
            Risk::Critical => "CRITICAL",
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Risk::High | Risk::Critical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    pub risk: Risk,
    pub required_approvals: u32,
    pub approval_window_sec: i64,
}

pub const DEFAULT_POLICY: CommandPolicy = CommandPolicy {
    risk: Risk::Low,
    required_approvals: 1,
    approval_window_sec: 30,
};

/// Reserved approval identity for bulk confirmation.
pub const CONFIRM_ALL_IDENTITY: &str = "*";

const HIGH_RISK_DUAL: CommandPolicy = CommandPolicy {
    risk: Risk::High,
    required_approvals: 2,
    approval_window_sec: 90,
};

pub fn classify(cmd: &str) -> CommandPolicy {
    match cmd {
        "state.pause" | "state.resume" | "state.stop" | "mode.switch" => DEFAULT_POLICY,
        "orders.confirm" | "orders.reject" | "orders.confirm_all" | "orders.cancel"
        | "live.cancel" => HIGH_RISK_DUAL,
        "stop.now" => CommandPolicy {
            risk: Risk::Critical,
            required_approvals: 1,
            approval_window_sec: 5,
        },
        _ => DEFAULT_POLICY,
    }
}

/// Canonical approval identity for a command. Two commands targeting the
/// same identity share one approval record.
pub fn identity_for(cmd: &str, args: &Value) -> String {
    if cmd == "orders.confirm_all" {
        return CONFIRM_ALL_IDENTITY.to_string();
    }
    if cmd.starts_with("orders.") || cmd == "live.cancel" {
        for key in ["token", "id"] {
            if let Some(v) = args.get(key).and_then(|v| v.as_str()) {
                if !v.is_empty() {
                    return v.to_ascii_uppercase();
                }
            }
        }
    }
    if cmd == "mode.switch" {
        if let Some(target) = args.get("target").and_then(|v| v.as_str()) {
            return target.to_string();
        }
    }
    cmd.to_string()
}
