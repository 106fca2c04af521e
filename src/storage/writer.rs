// src/storage/writer.rs

use super::PersistentStore;
use crate::key_manager::KeyManager;
use crate::metrics::METRICS;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Single-writer persistence task. Accounting paths nudge it through an
/// unbounded channel; nudges inside one debounce window coalesce into one
/// snapshot write. Shutdown performs a final flush.
pub struct SnapshotWriter {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SnapshotWriter {
    /// Spawns the writer and wires its nudge channel into the manager.
    pub fn spawn(
        manager: Arc<KeyManager>,
        store: Arc<dyn PersistentStore>,
        debounce: Duration,
    ) -> Self {
        let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
        manager.set_persist_channel(nudge_tx);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(Self::run(manager, store, debounce, nudge_rx, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    async fn run(
        manager: Arc<KeyManager>,
        store: Arc<dyn PersistentStore>,
        debounce: Duration,
        mut nudge_rx: mpsc::UnboundedReceiver<()>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut stopped = false;
        while !stopped {
            tokio::select! {
                _ = &mut stop_rx => break,
                nudge = nudge_rx.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                    // Let further nudges pile up, then write once for all
                    // of them.
                    tokio::select! {
                        _ = &mut stop_rx => stopped = true,
                        _ = tokio::time::sleep(debounce) => {}
                    }
                    while nudge_rx.try_recv().is_ok() {}
                    Self::write_once(&manager, &store).await;
                }
            }
        }
        Self::write_once(&manager, &store).await;
        debug!("Snapshot writer stopped");
    }

    async fn write_once(manager: &KeyManager, store: &Arc<dyn PersistentStore>) {
        let snapshot = manager.snapshot();
        match store.save(&snapshot).await {
            Ok(()) => METRICS.snapshots_written_total.increment(1),
            Err(e) => {
                // Persistence is best-effort; dispatch never fails on it.
                error!(error = %e, "Failed to persist usage snapshot");
                METRICS.snapshot_errors_total.increment(1);
            }
        }
    }

    /// Stops the writer after a final flush.
    pub async fn shutdown(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = self.handle.await {
            error!(error = %e, "Snapshot writer task failed during shutdown");
        } else {
            info!("Snapshot writer flushed and stopped");
        }
    }
}
