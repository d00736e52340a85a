//! sqlmux server - multiplexed SQL query execution over one endpoint
//!
//! Usage:
//!   sqlmux-server [--codec json|msgpack] [--listen <addr>] [--env <file>] [--seed]
//!
//! Database settings come from `.env` / environment variables
//! (`DB_HOST`, `DB_USERNAME`, `DB_PASSWORD`, `DB_DATABASE_NAME`,
//! `DB_POOL_SIZE`, `DB_HEARTBEAT_INTERVAL`, optional `QUEUE_CAPACITY`).
//! The codec is a deployment-time choice; clients do not negotiate it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::{info, warn};

use sqlmux::{
    codec_by_name, AppConfig, ConnectionPool, Dispatcher, Endpoint, PgConnector, RequestHandler,
    RequestQueue, LISTEN_ADDR, WORKER_COUNT,
};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("sqlmux-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("sqlmux-server {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Multiplexed SQL query-execution service");
        println!();
        println!("Usage: sqlmux-server [--codec json|msgpack] [--listen <addr>] [--env <file>] [--seed]");
        println!();
        println!("Flags:");
        println!("  --codec        Wire codec (default: json)");
        println!("  --listen       Listen address (default: {})", LISTEN_ADDR);
        println!("  --env          Explicit .env file path");
        println!("  --seed         Create and seed the demo schema before serving");
        println!("  -V, --version  Print version information");
        println!("  -h, --help     Print this help message");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        )
        .init();

    let codec_name = flag_value(&args, "--codec").unwrap_or("json");
    let Some(codec) = codec_by_name(codec_name) else {
        bail!("unknown codec '{}' (expected json or msgpack)", codec_name);
    };

    let listen_addr = flag_value(&args, "--listen").unwrap_or(LISTEN_ADDR);

    let config = match flag_value(&args, "--env") {
        Some(path) => AppConfig::from_path(std::path::Path::new(path)),
        None => AppConfig::load(),
    }
    .context("failed to load configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting sqlmux-server");

    let connector = Arc::new(PgConnector::from_config(&config));
    let pool = ConnectionPool::new(connector, config.db_pool_size, config.heartbeat_interval())
        .context("initial pool population failed")?;

    if args.iter().any(|a| a == "--seed") {
        seed_demo_schema(&pool).context("schema seeding failed")?;
    }

    let endpoint = Endpoint::bind(listen_addr)
        .with_context(|| format!("failed to bind {}", listen_addr))?;

    let queue = Arc::new(match config.queue_capacity {
        Some(capacity) => RequestQueue::bounded(capacity),
        None => RequestQueue::unbounded(),
    });

    let handler = Arc::new(RequestHandler::new(
        Arc::clone(&pool),
        Arc::clone(&codec),
        Arc::clone(&endpoint),
    ));

    let dispatcher = Dispatcher::start(
        Arc::clone(&endpoint),
        Arc::clone(&queue),
        codec,
        handler,
        WORKER_COUNT,
    );

    // First SIGINT/SIGTERM stops the receive loop; the main thread
    // then drains and exits.
    let stop = dispatcher.stop_flag();
    let mut signals = signal_hook::iterator::Signals::new(&[
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            warn!(signal, "shutdown signal received");
            stop.store(true, Ordering::SeqCst);
        }
    });

    info!(addr = listen_addr, "serving");
    dispatcher.run();

    dispatcher.shutdown();
    pool.shutdown();
    info!("exited cleanly");
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// Recreate the demo `users` table and bulk-insert 5000 rows, all
/// through pooled connections.
fn seed_demo_schema(pool: &Arc<ConnectionPool>) -> sqlmux::Result<()> {
    const USER_COUNT: usize = 5000;

    let mut conn = pool.acquire()?;
    conn.execute("DROP TABLE IF EXISTS users")?;
    conn.execute(
        "CREATE TABLE users (\
         id SERIAL PRIMARY KEY,\
         name TEXT NOT NULL,\
         email TEXT NOT NULL,\
         created_at TIMESTAMPTZ NOT NULL DEFAULT now())",
    )?;

    let mut insert = String::from("INSERT INTO users (name, email) VALUES ");
    for i in 1..=USER_COUNT {
        if i > 1 {
            insert.push_str(", ");
        }
        insert.push_str(&format!("('User {}', 'user{}@example.com')", i, i));
    }
    conn.execute(&insert)?;

    info!(rows = USER_COUNT, "demo schema seeded");
    Ok(())
}
