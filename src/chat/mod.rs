pub mod auth;
pub mod menu;
pub mod poller;
pub mod transport;

pub use poller::{ChatIngress, ChatIngressConfig, IngressError};
pub use transport::{BotApi, ChatError, ChatTransport};
