//! Socket-based host/peer round trip over localhost.

use std::{sync::Arc, time::Duration};

use replica_host::HostServer;
use replica_peer::{client::NetReconciler, PeerClient};
use replica_shared::{
    clock::SystemClock,
    codec::FieldCodec,
    config::ReplicationConfig,
    entity::EntityFactory,
    math::Vec3,
    mover::{Mover, ShadowMover},
    net::{ControlMsg, ReliableConn, PROTOCOL_VERSION},
};
use replica_tests::init_tracing;

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..300 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("timed out waiting for {what}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_and_peer_round_trip() -> anyhow::Result<()> {
    init_tracing();

    let mut cfg = ReplicationConfig {
        server_addr: "127.0.0.1:0".to_string(),
        ..ReplicationConfig::default()
    };
    let server = Arc::new(HostServer::bind(&cfg, Arc::new(SystemClock::new())).await?);
    cfg.server_addr = server.local_addr()?.to_string();
    let scheduler = server.scheduler().clone();

    let id = scheduler.add_entity(Box::new(Mover::new(
        "net-mover",
        Vec3::ZERO,
        Vec3::new(10.0, 0.0, 0.0),
        0.1,
    )));
    tokio::spawn(server.clone().run_accept_loop());

    let mut factory = EntityFactory::new();
    ShadowMover::register(&mut factory);
    let reconciler = Arc::new(NetReconciler::new(
        FieldCodec,
        factory,
        &cfg,
        Arc::new(SystemClock::new()),
    ));
    let client = PeerClient::connect(&cfg, reconciler.clone()).await?;
    assert!(client.is_connected());

    let ticker = {
        let scheduler = scheduler.clone();
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            loop {
                scheduler.tick(0.1);
                reconciler.tick(0.01);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    wait_for("shadow with deltas", || {
        reconciler.shadow_ids() == vec![id] && reconciler.last_seen_tick().unwrap_or(0) > 2
    })
    .await?;
    let label = reconciler.with_shadow(id, |s| {
        s.as_any()
            .downcast_ref::<ShadowMover>()
            .map(|m| m.label.clone())
    });
    assert_eq!(label.flatten().as_deref(), Some("net-mover"));
    assert_eq!(server.peer_count(), 1);

    scheduler.remove_entity(id);
    wait_for("shadow removal", || reconciler.is_empty()).await?;

    client.shutdown("test done").await?;
    wait_for("host to detach peer", || server.peer_count() == 0).await?;

    ticker.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_rejects_wrong_protocol_version() -> anyhow::Result<()> {
    init_tracing();

    let cfg = ReplicationConfig {
        server_addr: "127.0.0.1:0".to_string(),
        ..ReplicationConfig::default()
    };
    let server = Arc::new(HostServer::bind(&cfg, Arc::new(SystemClock::new())).await?);
    let addr = server.local_addr()?;

    let accept = tokio::spawn({
        let server = server.clone();
        async move { server.accept_one().await }
    });

    let mut conn = ReliableConn::connect(addr).await?;
    conn.send_control(&ControlMsg::Hello {
        protocol: PROTOCOL_VERSION + 1,
    })
    .await?;

    assert!(accept.await?.is_err());
    assert_eq!(server.peer_count(), 0);
    Ok(())
}
