//! Standalone peer binary.
//!
//! Usage:
//!   cargo run -p replica_peer -- [--config peer.json] [--addr 127.0.0.1:40000]
//!       [--tick-hz 60]
//!
//! The peer connects to a host, mirrors its movers as shadows and renders
//! nothing; state is visible through the console.
//!
//! Console commands:
//!   status   - Show reconciler counters
//!   list     - Show every live shadow
//!   quit     - Disconnect and exit

use std::{
    env,
    io::{BufRead, Write},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use replica_peer::{client::NetReconciler, PeerClient};
use replica_shared::{
    clock::SystemClock, codec::FieldCodec, config::ReplicationConfig, entity::EntityFactory,
    mover::ShadowMover,
};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ReplicationConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            ReplicationConfig::load(path)?
        }
        None => ReplicationConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("--tick-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn exec_console(line: &str, reconciler: &NetReconciler) -> Vec<String> {
    match line {
        "status" => {
            let stats = reconciler.stats();
            vec![
                format!("Known ids: {}", reconciler.len()),
                format!("Live shadows: {}", reconciler.shadow_ids().len()),
                format!("Last tick: {:?}", reconciler.last_seen_tick()),
                format!("Latency delta: {:.3}s", reconciler.latency_delta()),
                format!("{stats:?}"),
            ]
        }
        "list" => reconciler
            .shadow_ids()
            .into_iter()
            .filter_map(|id| {
                reconciler.with_shadow(id, |s| {
                    let mover = s.as_any().downcast_ref::<ShadowMover>()?;
                    Some(format!(
                        "{id} {} pos={:?} vel={:?}",
                        mover.label, mover.position, mover.velocity
                    ))
                })?
            })
            .collect(),
        other => vec![format!("Unknown command: {other}")],
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting peer");

    let mut factory = EntityFactory::new();
    ShadowMover::register(&mut factory);
    let reconciler = Arc::new(NetReconciler::new(
        FieldCodec,
        factory,
        &cfg,
        Arc::new(SystemClock::new()),
    ));

    let client = PeerClient::connect(&cfg, reconciler.clone())
        .await
        .context("connect")?;

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Peer connected. Type 'status' or 'list', 'quit' to exit.");

    let tick_interval = cfg.tick_interval();
    let dt = tick_interval.as_secs_f32();
    let mut last_report = tokio::time::Instant::now();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            if line == "quit" || line == "exit" {
                return client.shutdown("quit").await;
            }
            for out in exec_console(&line, &reconciler) {
                println!("{out}");
            }
        }

        if !client.is_connected() {
            println!("Disconnected from host.");
            break;
        }

        reconciler.tick(dt);

        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = tokio::time::Instant::now();
            info!(
                shadows = reconciler.shadow_ids().len(),
                last_tick = ?reconciler.last_seen_tick(),
                latency = reconciler.latency_delta(),
                "Peer status"
            );
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
