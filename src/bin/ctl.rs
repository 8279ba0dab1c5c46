use clap::{Parser, Subcommand};
use marketlab_control_rs::approvals::ApprovalLedger;
use marketlab_control_rs::bus::{BusStore, EnqueueRequest, Source};
use marketlab_control_rs::clock::{Clock, SystemClock};
use marketlab_control_rs::config::Settings;
use marketlab_control_rs::orders::OrderStore;
use marketlab_control_rs::persistence::redb_store::{RedbStore, StoreError};
use marketlab_control_rs::projection;
use marketlab_control_rs::worker::{Worker, WorkerConfig};
use std::sync::Arc;

/// Seconds after which the worker heartbeat counts as stale.
const HEARTBEAT_STALE_SEC: i64 = 10;

#[derive(Parser)]
#[command(name = "ctl", version, about = "MarketLab control bus CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a command and print its cmd_id
    Enqueue {
        /// Dotted command name, e.g. state.pause
        #[arg(long)]
        cmd: String,
        /// Command args as JSON
        #[arg(long, default_value = "{}")]
        args: String,
        /// TTL in seconds
        #[arg(long)]
        ttl: Option<i64>,
        /// Optional dedupe key for idempotent enqueue
        #[arg(long)]
        dedupe_key: Option<String>,
    },
    /// List pending NEW commands; execute them with --apply
    Drain {
        #[arg(long)]
        apply: bool,
    },
    /// Enqueue the kill-switch
    StopNow,
    /// Exit 0 when storage is reachable and the worker heartbeat is fresh
    Health,
    /// Print the projection snapshot as JSON
    Status,
}

struct Context {
    bus: BusStore,
    orders: OrderStore,
    approvals: ApprovalLedger,
    settings: Settings,
}

fn open_context(settings: Settings) -> Result<Context, StoreError> {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(RedbStore::open(&settings.bus_db_path)?);
    let bus = BusStore::new(store.clone(), clock.clone())?;
    let orders = OrderStore::new(store, clock, settings.orders_token_len)?;
    let approvals = ApprovalLedger::new(bus.clone(), settings.dual_control_strict())?;
    Ok(Context {
        bus,
        orders,
        approvals,
        settings,
    })
}

fn cli_actor() -> String {
    format!("cli:{}", std::process::id())
}

fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::new() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("config.invalid: {e}");
            std::process::exit(2);
        }
    };

    let ctx = match open_context(settings) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("storage.unavailable: {e}");
            // The health probe reports unhealthy rather than a transient
            // storage failure.
            let code = if matches!(cli.command, Commands::Health) { 2 } else { 4 };
            std::process::exit(code);
        }
    };

    let outcome = match cli.command {
        Commands::Enqueue {
            cmd,
            args,
            ttl,
            dedupe_key,
        } => run_enqueue(&ctx, &cmd, &args, ttl, dedupe_key.as_deref()),
        Commands::Drain { apply } => run_drain(ctx, apply),
        Commands::StopNow => run_enqueue(&ctx, "stop.now", "{}", None, None),
        Commands::Health => run_health(&ctx),
        Commands::Status => run_status(&ctx),
    };

    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("storage.unavailable: {e}");
            std::process::exit(4);
        }
    }
}

fn run_enqueue(
    ctx: &Context,
    cmd: &str,
    args: &str,
    ttl: Option<i64>,
    dedupe_key: Option<&str>,
) -> Result<i32, StoreError> {
    let args: serde_json::Value = match serde_json::from_str(args) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("config.invalid: --args is not valid JSON: {e}");
            return Ok(2);
        }
    };
    let mut request = EnqueueRequest::new(cmd, Source::Cli)
        .args(args)
        .actor(&cli_actor());
    if let Some(ttl) = ttl {
        request = request.ttl(Some(ttl));
    }
    if let Some(key) = dedupe_key {
        request = request.dedupe_key(key);
    }
    let cmd_id = ctx.bus.enqueue(request)?;
    println!("{cmd_id}");
    Ok(0)
}

fn run_drain(ctx: Context, apply: bool) -> Result<i32, StoreError> {
    if !apply {
        let pending = ctx.bus.list_new()?;
        if pending.is_empty() {
            println!("queue empty");
            return Ok(0);
        }
        for cmd in pending {
            println!("would run {} {} {}", cmd.cmd_id, cmd.cmd, cmd.args);
        }
        return Ok(0);
    }
    let cfg = WorkerConfig::from_settings(&ctx.settings);
    let mut worker = Worker::new(ctx.bus, ctx.orders, ctx.approvals, cfg)?;
    let processed = worker.process_available(None)?;
    println!("processed {processed}");
    Ok(0)
}

fn run_health(ctx: &Context) -> Result<i32, StoreError> {
    let now = SystemClock.now_epoch();
    let heartbeat = ctx
        .bus
        .get_state("worker_heartbeat_ts")?
        .and_then(|s| s.parse::<i64>().ok());
    match heartbeat {
        Some(ts) if now - ts <= HEARTBEAT_STALE_SEC => {
            println!("ok");
            Ok(0)
        }
        Some(ts) => {
            eprintln!("worker heartbeat stale ({}s)", now - ts);
            Ok(2)
        }
        None => {
            eprintln!("no worker heartbeat recorded");
            Ok(2)
        }
    }
}

fn run_status(ctx: &Context) -> Result<i32, StoreError> {
    let snapshot = projection::snapshot(
        &ctx.bus,
        &ctx.orders,
        &ctx.approvals,
        projection::DEFAULT_EVENT_TAIL,
    )?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(0)
}
