use marketlab_control_rs::bus::BusStore;
use marketlab_control_rs::chat::{BotApi, ChatIngress, ChatIngressConfig, IngressError};
use marketlab_control_rs::clock::SystemClock;
use marketlab_control_rs::config::Settings;
use marketlab_control_rs::orders::OrderStore;
use marketlab_control_rs::persistence::redb_store::RedbStore;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    dotenv::dotenv().ok();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    if !settings.chat_enabled() {
        info!("chat disabled; set CHAT_ENABLED=1 to start");
        return;
    }

    let cfg = match ChatIngressConfig::from_settings(&settings) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("invalid chat configuration: {}", e);
            std::process::exit(2);
        }
    };
    let token = settings.chat_api_token.clone().unwrap_or_default();
    let transport = match BotApi::new(&settings.chat_api_url, &token, cfg.long_poll_sec) {
        Ok(t) => t,
        Err(e) => {
            error!("transport setup failed: {}", e);
            std::process::exit(2);
        }
    };

    let clock = Arc::new(SystemClock);
    let (bus, orders) = match open_stores(&settings, clock) {
        Ok(pair) => pair,
        Err(e) => {
            error!("storage unavailable: {}", e);
            std::process::exit(4);
        }
    };

    let mut ingress = ChatIngress::new(transport, bus, orders, cfg);
    if let Err(e) = ingress.startup().await {
        match e {
            IngressError::Auth(msg) => {
                error!("chat auth failed: {}", msg);
                std::process::exit(3);
            }
            other => {
                error!("chat startup failed: {}", other);
                std::process::exit(2);
            }
        }
    }

    info!("✅ chat ingress ready");
    if let Err(e) = ingress.run().await {
        error!("chat ingress stopped: {}", e);
        std::process::exit(4);
    }
}

fn open_stores(
    settings: &Settings,
    clock: Arc<SystemClock>,
) -> Result<(BusStore, OrderStore), marketlab_control_rs::persistence::redb_store::StoreError> {
    let store = Arc::new(RedbStore::open(&settings.bus_db_path)?);
    let bus = BusStore::new(store.clone(), clock.clone())?;
    let orders = OrderStore::new(store, clock, settings.orders_token_len)?;
    Ok((bus, orders))
}
