use marketlab_control_rs::approvals::ApprovalLedger;
use marketlab_control_rs::bus::BusStore;
use marketlab_control_rs::clock::SystemClock;
use marketlab_control_rs::config::Settings;
use marketlab_control_rs::orders::OrderStore;
use marketlab_control_rs::persistence::redb_store::RedbStore;
use marketlab_control_rs::worker::{Worker, WorkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 500;

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

    info!("MarketLab control worker starting (db: {})", settings.bus_db_path);

    let clock = Arc::new(SystemClock);
    let store = match RedbStore::open(&settings.bus_db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("storage unavailable: {}", e);
            std::process::exit(4);
        }
    };

    let result = async {
        let bus = BusStore::new(store.clone(), clock.clone())?;
        let orders = OrderStore::new(store.clone(), clock.clone(), settings.orders_token_len)?;
        let approvals = ApprovalLedger::new(bus.clone(), settings.dual_control_strict())?;
        let mut worker = Worker::new(bus, orders, approvals, WorkerConfig::from_settings(&settings))?;
        worker.startup(std::process::id())?;
        info!("✅ worker ready, polling every {}ms", POLL_INTERVAL_MS);
        worker
            .run_forever(Duration::from_millis(POLL_INTERVAL_MS))
            .await
    }
    .await;

    if let Err(e) = result {
        error!("worker stopped on storage failure: {}", e);
        std::process::exit(4);
    }
}
