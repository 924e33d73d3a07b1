//! FIFO of work waiting for the binlog to sync.
//!
//! Each push carries follow-up items that may only run once every write made
//! before the push is durable. A single worker task drains the queue, syncs
//! once per batch and hands the items back in push order.

use crate::traits::Binlog;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Queue of follow-ups gated on `Binlog::sync`.
pub struct SyncQueue<T> {
    tx: mpsc::UnboundedSender<Vec<T>>,
}

impl<T: Send + 'static> SyncQueue<T> {
    /// Spawns the worker.
    ///
    /// `on_synced` receives each batch with the sync result and returns false
    /// once nobody listens any more.
    pub fn spawn<F>(binlog: Arc<dyn Binlog>, on_synced: F) -> Self
    where
        F: Fn(Vec<T>, Result<()>) -> bool + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<T>>();
        tokio::spawn(async move {
            while let Some(mut batch) = rx.recv().await {
                while let Ok(more) = rx.try_recv() {
                    batch.extend(more);
                }
                let result = binlog.sync().await;
                if let Err(e) = &result {
                    tracing::error!(error = %e, "Binlog sync failed");
                }
                if !on_synced(batch, result) {
                    break;
                }
            }
        });
        Self { tx }
    }

    /// Schedules follow-ups after the next sync.
    pub fn push(&self, followups: Vec<T>) {
        if self.tx.send(followups).is_err() {
            tracing::warn!("Sync worker stopped; follow-ups dropped");
        }
    }
}
