//! sqlmux batch client - sends identified queries and collects replies
//!
//! Usage:
//!   sqlmux-client [--addr <host:port>] [--codec json|msgpack] [--count N]
//!
//! Doubles as a smoke test: fires `--count` queries against the demo
//! `users` table over one connection and waits for every reply.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use sqlmux::{ClientConn, Row, LISTEN_ADDR};

#[derive(Serialize)]
struct WireRequest<'a> {
    id: &'a str,
    query: &'a str,
}

#[derive(Deserialize)]
struct WireResult {
    id: String,
    data: Vec<Row>,
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let addr = flag_value(&args, "--addr").unwrap_or(LISTEN_ADDR);
    let codec = flag_value(&args, "--codec").unwrap_or("json");
    let count: usize = flag_value(&args, "--count")
        .unwrap_or("100")
        .parse()
        .context("invalid --count")?;
    if codec != "json" && codec != "msgpack" {
        bail!("unknown codec '{}' (expected json or msgpack)", codec);
    }

    let identity = format!("client_{}", std::process::id());
    let mut conn = ClientConn::connect(addr, identity.as_bytes())
        .with_context(|| format!("connect to {}", addr))?;
    println!("Client ID: {}", identity);

    let started = Instant::now();
    let mut pending: HashMap<String, String> = HashMap::new();

    for i in 0..count {
        let query_id = format!("query_{}", i);
        // Spread reads across the seeded table.
        let offset = (i * 37) % 5000;
        let query = format!("SELECT users.* FROM users LIMIT 100 OFFSET {}", offset);

        let request = WireRequest {
            id: &query_id,
            query: &query,
        };
        let payload = match codec {
            "msgpack" => rmp_serde::to_vec_named(&request)?,
            _ => serde_json::to_vec(&request)?,
        };
        conn.send(&payload)?;
        pending.insert(query_id, query);
    }
    println!("Sent {} queries", count);

    let mut rows_received = 0usize;
    while !pending.is_empty() {
        let Some((_, payload)) = conn.recv()? else {
            bail!("server closed the connection with {} replies outstanding", pending.len());
        };

        let result: WireResult = match codec {
            "msgpack" => rmp_serde::from_slice(&payload).context("undecodable reply")?,
            _ => serde_json::from_slice(&payload).context("undecodable reply")?,
        };

        if pending.remove(&result.id).is_none() {
            println!("Reply for unknown query ID {}", result.id);
            continue;
        }
        rows_received += result.data.len();
    }

    let elapsed = started.elapsed();
    println!(
        "Ran {} queries ({} rows) in {} ms",
        count,
        rows_received,
        elapsed.as_millis()
    );
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}
