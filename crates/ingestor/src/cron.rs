//! Scheduled maintenance worker.
//!
//! Runs alongside the ingestion loop and periodically sweeps the store for
//! holes in the height sequence. Each sweep requests a bounded re-emit of
//! the first hole it finds and hands the missing heights to the controller
//! over a channel, so the controller alone mutates its missed-block set.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::NodeApi;
use crate::storage::Storage;

/// How often the gap sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Background maintenance worker.
pub struct CronWorker {
    storage: Storage,
    node: Arc<dyn NodeApi>,
    max_batch_block: i64,
    gap_notices: mpsc::Sender<i64>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CronWorker {
    /// Create a worker. `gap_notices` feeds the controller's missed-block
    /// set; `max_batch_block` bounds each re-emit window.
    pub fn new(
        storage: Storage,
        node: Arc<dyn NodeApi>,
        max_batch_block: i64,
        gap_notices: mpsc::Sender<i64>,
    ) -> Self {
        Self {
            storage,
            node,
            max_batch_block,
            gap_notices,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// One-time setup before the controller is built. Fails startup when
    /// the store is unreachable.
    pub async fn prepare(&self) -> Result<()> {
        self.storage
            .health_check()
            .await
            .context("cron worker store probe failed")
    }

    /// Start the sweep loop. Non-blocking; the worker runs until
    /// [`CronWorker::stop`] is called.
    pub fn start(&mut self) {
        let storage = self.storage.clone();
        let node = Arc::clone(&self.node);
        let max_batch_block = self.max_batch_block;
        let gap_notices = self.gap_notices.clone();
        let cancel = self.cancel.clone();

        info!(interval = ?SWEEP_INTERVAL, "cron worker started");
        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) =
                            sweep_gaps(&storage, node.as_ref(), max_batch_block, &gap_notices).await
                        {
                            warn!("gap sweep failed: {:#}", e);
                        }
                    }
                }
            }
            debug!("cron worker exited");
        }));
    }

    /// Signal the worker to stop and wait for the sweep task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Find the first hole below the tip and request its redelivery.
///
/// Only one window per sweep: later holes are picked up by subsequent
/// sweeps once the first one is filled.
pub(crate) async fn sweep_gaps(
    storage: &Storage,
    node: &dyn NodeApi,
    max_batch_block: i64,
    gap_notices: &mpsc::Sender<i64>,
) -> Result<()> {
    let gap_start: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(b.height + 1) FROM btc_block b \
         WHERE NOT EXISTS (SELECT 1 FROM btc_block n WHERE n.height = b.height + 1) \
           AND b.height < (SELECT MAX(height) FROM btc_block)",
    )
    .fetch_one(storage.pool())
    .await
    .context("failed to scan for height gaps")?;

    let Some(gap_start) = gap_start else {
        debug!("no gaps below the tip");
        return Ok(());
    };

    let next_present: i64 =
        sqlx::query_scalar("SELECT MIN(height) FROM btc_block WHERE height > $1")
            .bind(gap_start)
            .fetch_one(storage.pool())
            .await
            .context("failed to find the end of a height gap")?;

    let end = (next_present - 1).min(gap_start + max_batch_block - 1);

    info!(from = gap_start, to = end, "requesting redelivery of missing heights");
    for height in gap_start..=end {
        if gap_notices.send(height).await.is_err() {
            // Controller is gone; nothing left to notify.
            return Ok(());
        }
    }

    node.send_batch_block(gap_start, end).await
}
