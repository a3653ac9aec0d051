//! Clicker Sync Demo
//!
//! Runs a primary and a companion device in one process: taps, a purchase,
//! companion taps while the peer is out of range, and convergence once it is
//! back.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clicker_sync::{
    VERSION, Catalog, Clock, Device, DeviceConfig, DeviceRole, DeviceRuntime, LedgerView,
    LoopbackLink, PeerLink, SystemClock, WsPeerLink,
    device::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore},
    sync::link::SyncEndpoint,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Clicker Sync v{}", VERSION);

    let base = DeviceConfig::from_env().context("reading CLICKER_* configuration")?;
    let catalog = Arc::new(Catalog::standard());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let primary = open_device(
        DeviceConfig { role: DeviceRole::Primary, device_id: None, ..base.clone() },
        "primary",
        catalog.clone(),
        clock.clone(),
    )
    .await;
    let companion = open_device(
        DeviceConfig { role: DeviceRole::Companion, device_id: None, ..base.clone() },
        "companion",
        catalog,
        clock,
    )
    .await;

    // Companion talks to the primary in-process unless a peer URL or listen
    // address is configured.
    let loopback = LoopbackLink::new(Arc::new(primary.clone()) as Arc<dyn SyncEndpoint>);
    let mut primary_rt = DeviceRuntime::start(primary.clone(), None).await;
    let link: Arc<dyn PeerLink> = match (&base.peer_url, base.listen_addr) {
        (Some(url), _) => Arc::new(WsPeerLink::new(url.clone(), base.peer_timeout)),
        (None, Some(addr)) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding peer listener on {}", addr))?;
            let url = format!("ws://{}", listener.local_addr()?);
            primary_rt.serve(listener);
            Arc::new(WsPeerLink::new(url, base.peer_timeout))
        }
        (None, None) => Arc::new(loopback.clone()),
    };

    info!("=== Tapping on the phone ===");
    for _ in 0..150 {
        primary.tap().await?;
    }
    let view = primary.purchase("chromebook", 1).await?;
    report("primary", &view);

    info!("=== Mini-game payout ===");
    let view = primary
        .record_mini_game_result(Decimal::from(100), Decimal::new(125, 2))
        .await?;
    report("primary", &view);

    info!("=== Companion taps out of range ===");
    loopback.set_reachable(false);
    for _ in 0..25 {
        companion.tap().await?;
    }
    if let Err(e) = companion.sync_once(link.as_ref()).await {
        info!("Companion sync deferred: {}", e);
    }
    report("companion", &companion.snapshot().await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    loopback.set_reachable(true);

    info!("=== Back in range ===");
    let companion_rt = DeviceRuntime::start(companion.clone(), Some(link)).await;
    tokio::time::sleep(base.sync_interval * 2).await;

    let p = primary.snapshot().await;
    let c = companion.snapshot().await;
    report("primary", &p);
    report("companion", &c);
    if p.balance == c.balance {
        info!("CONVERGED: both devices at {}", p.balance);
    } else {
        warn!("Devices still differ: {} vs {}", p.balance, c.balance);
    }

    companion_rt.shutdown().await?;
    primary_rt.shutdown().await?;
    Ok(())
}

/// Open a device, falling back to a fresh ledger when its snapshot is unreadable.
async fn open_device(
    config: DeviceConfig,
    name: &str,
    catalog: Arc<Catalog>,
    clock: Arc<dyn Clock>,
) -> Device {
    let store: Arc<dyn SnapshotStore> = match &config.data_path {
        Some(dir) => Arc::new(FileSnapshotStore::new(dir.join(format!("{}.json", name)))),
        None => Arc::new(MemorySnapshotStore::new()),
    };

    match Device::open(config.clone(), catalog.clone(), store.clone(), clock.clone()).await {
        Ok(device) => device,
        Err(e) => {
            warn!("Could not restore {} snapshot ({}), starting fresh", name, e);
            Device::fresh(config, catalog, store, clock)
        }
    }
}

fn report(name: &str, view: &LedgerView) {
    info!(
        "[{}] balance {} | {}/tap {}/s | earned {} spent {} | steps {} | pending deltas {}",
        name,
        view.balance,
        view.per_click_yield,
        view.per_second_yield,
        view.total_ever_earned,
        view.total_spent,
        view.total_steps,
        view.pending_deltas,
    );
}
