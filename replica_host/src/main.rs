//! Standalone host binary.
//!
//! Usage:
//!   cargo run -p replica_host -- [--config host.json] [--addr 127.0.0.1:40000]
//!       [--tick-hz 64] [--update-period 0.1] [--movers 8]
//!       [--drop 0.1] [--latency-ms 80] [--seed 1]
//!
//! The host accepts peers in the background, spawns a few movers and ticks
//! the scheduler at a fixed rate. Any of `--drop`, `--latency-ms` or `--seed`
//! turns on network emulation.

use std::{env, sync::Arc, time::Duration};

use anyhow::Context;
use replica_host::HostServer;
use replica_shared::{
    clock::SystemClock,
    config::{NetEmulation, ReplicationConfig},
    math::Vec3,
    mover::Mover,
};
use tracing::info;

struct Args {
    cfg: ReplicationConfig,
    movers: u32,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).context("--config needs a path")?;
            ReplicationConfig::load(path)?
        }
        None => ReplicationConfig::default(),
    };
    let mut movers = 8;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--addr", Some(v)) => cfg.server_addr = v.clone(),
            ("--tick-hz", Some(v)) => cfg.tick_hz = v.parse().context("--tick-hz")?,
            ("--update-period", Some(v)) => {
                cfg.update_period_secs = v.parse().context("--update-period")?
            }
            ("--movers", Some(v)) => movers = v.parse().context("--movers")?,
            ("--drop", Some(v)) => {
                emulation(&mut cfg).drop_probability = v.parse().context("--drop")?
            }
            ("--latency-ms", Some(v)) => {
                emulation(&mut cfg).latency_ms = v.parse().context("--latency-ms")?
            }
            ("--seed", Some(v)) => emulation(&mut cfg).seed = Some(v.parse().context("--seed")?),
            ("--config", Some(_)) => {}
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }
    Ok(Args { cfg, movers })
}

fn emulation(cfg: &mut ReplicationConfig) -> &mut NetEmulation {
    cfg.emulation.get_or_insert(NetEmulation {
        drop_probability: 0.0,
        latency_ms: 0,
        seed: None,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, movers } = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        update_period = cfg.update_period_secs,
        emulation = ?cfg.emulation,
        "Starting host"
    );

    let server = Arc::new(
        HostServer::bind(&cfg, Arc::new(SystemClock::new()))
            .await
            .context("bind host")?,
    );
    info!(local = %server.local_addr()?, "Host listening");

    let scheduler = server.scheduler().clone();
    for n in 0..movers {
        let angle = n as f32 / movers.max(1) as f32 * std::f32::consts::TAU;
        let velocity = Vec3::new(angle.cos(), angle.sin(), 0.0) * 15.0;
        let id = scheduler.add_entity(Box::new(Mover::new(
            format!("mover-{n}"),
            Vec3::ZERO,
            velocity,
            cfg.update_period_secs,
        )));
        info!(%id, "Spawned mover");
    }

    tokio::spawn(server.clone().run_accept_loop());

    let tick_interval = cfg.tick_interval();
    let dt = tick_interval.as_secs_f32();
    let mut next_tick = tokio::time::Instant::now();
    let mut last_report = tokio::time::Instant::now();

    loop {
        scheduler.tick(dt);

        if last_report.elapsed() >= Duration::from_secs(5) {
            last_report = tokio::time::Instant::now();
            info!(
                tick = scheduler.current_tick(),
                entities = scheduler.entity_count(),
                peers = server.peer_count(),
                queued = scheduler.pending_deliveries(),
                dropped = scheduler.dropped_deliveries(),
                "Host status"
            );
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
