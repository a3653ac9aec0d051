//! Device Runtime
//!
//! Owns the background work of a running device: the foreground idle tick,
//! the peer sync cadence and, optionally, the peer listener. Everything is
//! torn down by [`DeviceRuntime::shutdown`] (or by dropping the runtime).

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::device::handle::{Device, SyncOutcome};
use crate::device::persistence::PersistenceError;
use crate::sync::link::{PeerLink, SyncEndpoint, serve_peer};
use crate::sync::scheduler::PeriodicTask;

/// Background loops of one device.
pub struct DeviceRuntime {
    device: Device,
    tick_task: PeriodicTask,
    sync_task: Option<PeriodicTask>,
    listener: Option<(broadcast::Sender<()>, JoinHandle<()>)>,
}

impl DeviceRuntime {
    /// Resume the device, then start the tick loop, plus a sync loop when
    /// `link` is given.
    ///
    /// A device restored from a clean shutdown is still suspended; resuming
    /// here credits the gap since then and lets the ticks accrue again.
    pub async fn start(device: Device, link: Option<Arc<dyn PeerLink>>) -> Self {
        let config = device.config().clone();
        device.resume().await;

        let ticker = device.clone();
        let tick_task = PeriodicTask::spawn("idle-tick", config.tick_interval, move || {
            let device = ticker.clone();
            async move {
                device.tick().await;
            }
        });

        let sync_task = link.map(|link| {
            let syncer = device.clone();
            PeriodicTask::spawn("peer-sync", config.sync_interval, move || {
                let device = syncer.clone();
                let link = link.clone();
                async move {
                    match device.sync_once(link.as_ref()).await {
                        Ok(SyncOutcome::Synced { deltas_applied, deltas_acked, .. }) => {
                            debug!("Sync cycle: {} applied, {} acked", deltas_applied, deltas_acked);
                        }
                        Ok(SyncOutcome::UpToDate | SyncOutcome::InProgress) => {}
                        // Deferred to the next cycle; the handle logs it.
                        Err(_) => {}
                    }
                }
            })
        });

        info!("Device runtime started as {:?}", config.role);
        Self {
            device,
            tick_task,
            sync_task,
            listener: None,
        }
    }

    /// Accept peer syncs on `listener` for the lifetime of the runtime.
    pub fn serve(&mut self, listener: TcpListener) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let endpoint: Arc<dyn SyncEndpoint> = Arc::new(self.device.clone());
        let handle = tokio::spawn(serve_peer(listener, endpoint, shutdown_rx));
        if let Some((old_tx, old_handle)) = self.listener.replace((shutdown_tx, handle)) {
            let _ = old_tx.send(());
            old_handle.abort();
        }
    }

    /// The device being driven.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Stop every loop, settle idle income and write a final snapshot.
    pub async fn shutdown(mut self) -> Result<(), PersistenceError> {
        self.tick_task.cancel();
        if let Some(task) = self.sync_task.take() {
            task.cancel();
        }
        if let Some((shutdown_tx, handle)) = self.listener.take() {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }

        self.device.suspend().await?;
        info!("Device runtime stopped");
        Ok(())
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        if let Some((shutdown_tx, handle)) = self.listener.take() {
            let _ = shutdown_tx.send(());
            handle.abort();
        }
    }
}
