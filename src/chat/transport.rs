//! Long-poll bot API client.
//!
//! The control channel speaks a Telegram-compatible bot API: `getMe`,
//! `getUpdates` (long poll), `sendMessage`, `answerCallbackQuery`. The
//! transport trait keeps the ingress loop testable without a network.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {description}")]
    Api { status: u16, description: String },
}

impl ChatError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == 401 || *status == 403)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRef {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub from: Option<UserRef>,
    pub chat: ChatRef,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: UserRef,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<IncomingMessage>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn identity(&self) -> Result<BotIdentity, ChatError>;
    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_sec: u64,
    ) -> Result<Vec<Update>, ChatError>;
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Value>,
    ) -> Result<(), ChatError>;
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), ChatError>;
}

pub struct BotApi {
    client: reqwest::Client,
    base_url: String,
}

impl BotApi {
    pub fn new(api_url: &str, token: &str, long_poll_sec: u64) -> Result<Self, ChatError> {
        // The client timeout must outlive the server-side long poll.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(long_poll_sec + 10))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
    ) -> Result<T, ChatError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self.client.post(&url).json(&body).send().await?;
        let status = response.status().as_u16();
        let envelope: ApiEnvelope<T> = response.json().await?;
        if !envelope.ok {
            return Err(ChatError::Api {
                status,
                description: envelope
                    .description
                    .unwrap_or_else(|| "unknown api failure".into()),
            });
        }
        envelope.result.ok_or(ChatError::Api {
            status,
            description: "missing result".into(),
        })
    }
}

#[async_trait]
impl ChatTransport for BotApi {
    async fn identity(&self) -> Result<BotIdentity, ChatError> {
        self.call("getMe", json!({})).await
    }

    async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_sec: u64,
    ) -> Result<Vec<Update>, ChatError> {
        let mut body = json!({ "timeout": timeout_sec });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body).await
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Value>,
    ) -> Result<(), ChatError> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(markup) = keyboard {
            body["reply_markup"] = markup;
        }
        let _: Value = self.call("sendMessage", body).await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), ChatError> {
        let _: Value = self
            .call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id, "text": text }),
            )
            .await?;
        Ok(())
    }
}
