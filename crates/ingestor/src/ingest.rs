//! The ingestion controller.
//!
//! One controller instance runs per topic, single-threaded: each message is
//! validated, decoded, linkage-checked and persisted before the next one is
//! looked at. The bus offset is committed only after the store transaction
//! commits, which together with the duplicate triage in [`Ingestor::save_block`]
//! turns at-least-once delivery into exactly-once persistence.

use anyhow::{Context, Result};
use chainsink_core::{Block, BlockData, MAX_REORG_DEPTH, RETRY_BACKOFF_SECS};
use sqlx::{Any, Transaction};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bus::BusConsumer;
use crate::config::Config;
use crate::decode;
use crate::linkage::{Linkage, LinkageChecker};
use crate::metrics::PipelineStats;
use crate::rpc::{NodeApi, OmniApi};
use crate::schema::SchemaValidator;
use crate::storage::{blocks, tether, Storage};

/// How the persistence transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveOutcome {
    /// All rows written; the transaction should commit.
    Committed,
    /// The block (or, at height 0, any block) is already stored.
    AlreadyStored,
    /// The block belongs to a fork deeper than the revert bound.
    StaleFork,
}

/// The ingestion and reorganization controller.
pub struct Ingestor {
    storage: Storage,
    omni: Option<Arc<dyn OmniApi>>,
    validator: Option<SchemaValidator>,
    checker: LinkageChecker,
    stats: Arc<PipelineStats>,
    /// Heights expected out of normal order because a re-emit was requested
    /// for them. Owned by the controller; fed by the cron worker's channel.
    missed_blocks: HashSet<i64>,
    gap_notices: mpsc::Receiver<i64>,
    database_enable: bool,
    min_omni_block_height: i64,
}

impl Ingestor {
    /// Build a controller from configuration and its collaborators. Fails
    /// fast on a bad schema document so startup aborts instead of looping.
    pub fn new(
        config: &Config,
        storage: Storage,
        node: Arc<dyn NodeApi>,
        omni: Option<Arc<dyn OmniApi>>,
        stats: Arc<PipelineStats>,
        gap_notices: mpsc::Receiver<i64>,
    ) -> Result<Self> {
        let validator = if config.schema.validation_enable {
            Some(
                SchemaValidator::from_file(&config.schema.file)
                    .context("failed to load payload schema")?,
            )
        } else {
            None
        };

        let checker = LinkageChecker::new(storage.clone(), node, config.node.max_batch_block);

        Ok(Self {
            storage,
            omni,
            validator,
            checker,
            stats,
            missed_blocks: HashSet::new(),
            gap_notices,
            database_enable: config.database.enable,
            min_omni_block_height: config.omni.min_block_height,
        })
    }

    /// Run the ingestion loop until the bus closes.
    ///
    /// When the overlay is enabled the backfill runs first; a backfill
    /// failure aborts startup rather than ingesting with a lagging overlay.
    pub async fn run<C: BusConsumer>(&mut self, consumer: &mut C) -> Result<()> {
        if self.omni.is_some() {
            self.make_up_omni().await.context("overlay backfill failed")?;
        }

        info!(
            database_enable = self.database_enable,
            "ingestion loop started"
        );

        while let Some(message) = consumer.next().await {
            self.drain_gap_notices();
            self.stats.record_receive();
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                bytes = message.payload.len(),
                "message received"
            );
            let payload = String::from_utf8_lossy(&message.payload).into_owned();

            // Per-message retry loop: decode and persistence failures retry
            // the same message after a backoff, a failed linkage check drops
            // it (the bus redelivers), success breaks out.
            loop {
                if let Some(validator) = &self.validator {
                    match validator.validate(&payload) {
                        Ok(true) => self.stats.record_validation_success(),
                        Ok(false) => {
                            self.stats.record_validation_error();
                            warn!(offset = message.offset, "payload failed schema validation");
                        }
                        Err(e) => error!("schema validation errored: {:#}", e),
                    }
                }

                let mut data = match decode::parse_block(&payload) {
                    Ok(data) => data,
                    Err(e) => {
                        self.stats.record_parse_error();
                        error!(
                            offset = message.offset,
                            "block parse error, retrying in {}s: {:#}", RETRY_BACKOFF_SECS, e
                        );
                        sleep(Duration::from_secs(RETRY_BACKOFF_SECS)).await;
                        continue;
                    }
                };

                let height = data.block.height;
                if self.missed_blocks.remove(&height) {
                    debug!(height, "height arrived on the gap-fill path");
                } else {
                    let outcome = self.checker.check(&data.block).await;
                    if height != 0 && outcome != Linkage::Continue {
                        debug!(height, ?outcome, "message dropped pending redelivery");
                        break;
                    }
                }

                if self.database_enable {
                    match self.save_block(&mut data).await {
                        Ok(()) => {
                            if let Err(e) = consumer.commit(&message).await {
                                warn!(offset = message.offset, "offset commit failed: {:#}", e);
                            }
                        }
                        Err(e) => {
                            error!(
                                height,
                                "block save failed, retrying in {}s: {:#}", RETRY_BACKOFF_SECS, e
                            );
                            sleep(Duration::from_secs(RETRY_BACKOFF_SECS)).await;
                            continue;
                        }
                    }
                }

                break;
            }
        }

        info!("bus closed, ingestion loop exiting");
        Ok(())
    }

    /// Persist a block in one store transaction.
    ///
    /// Duplicates and too-old forks are recognized before anything is
    /// written and reported as success, which is what makes redelivery
    /// harmless. Every failure path rolls the transaction back.
    pub async fn save_block(&self, data: &mut BlockData) -> Result<()> {
        let mut tx = match self.storage.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.stats.record_rollback();
                return Err(e);
            }
        };

        match self.save_block_inner(&mut tx, data).await {
            Ok(SaveOutcome::Committed) => match tx.commit().await {
                Ok(()) => {
                    self.stats.record_commit();
                    info!(height = data.block.height, "block saved");
                    Ok(())
                }
                Err(e) => {
                    self.stats.record_rollback();
                    Err(anyhow::Error::new(e)
                        .context(format!("failed to commit block {}", data.block.height)))
                }
            },
            Ok(outcome) => {
                let _ = tx.rollback().await;
                debug!(height = data.block.height, ?outcome, "nothing to persist");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                self.stats.record_rollback();
                Err(e)
            }
        }
    }

    async fn save_block_inner(
        &self,
        tx: &mut Transaction<'_, Any>,
        data: &mut BlockData,
    ) -> Result<SaveOutcome> {
        let height = data.block.height;
        let existing = blocks::block_at_height(&mut **tx, height).await?;

        if height == 0 {
            if blocks::tip_block(&mut **tx).await?.is_some() {
                warn!(height, "block already stored");
                return Ok(SaveOutcome::AlreadyStored);
            }
        } else if let Some(existing) = existing {
            if existing.hash == data.block.hash {
                warn!(height, "block already stored");
                return Ok(SaveOutcome::AlreadyStored);
            }

            let tip = blocks::tip_block(&mut **tx)
                .await?
                .context("conflicting block stored but tip lookup came back empty")?;
            if tip.height - height > MAX_REORG_DEPTH {
                warn!(height, tip = tip.height, "fork is too old to revert");
                return Ok(SaveOutcome::StaleFork);
            }

            // Displaced branch: unwind from the tip down to the fork point.
            // The overlay revert has to run first, while the block and
            // overlay rows it reads are still stored.
            for revert_height in (height..=tip.height).rev() {
                if let Some(omni) = &self.omni {
                    tether::revert_tether_address(tx, omni.as_ref(), revert_height).await?;
                }
                blocks::revert_block(tx, revert_height).await?;
                self.stats.record_revert_block();
            }
        }

        fill_block_miner(data);

        blocks::insert_block(tx, &data.block).await?;
        if !self.storage.dialect().insert_preserves_version() {
            blocks::set_block_version(tx, &data.block).await?;
        }

        // Outputs first: inputs resolve against them, including spends of
        // outputs created earlier in this very block.
        blocks::insert_vouts(tx, &data.vouts).await?;
        blocks::resolve_vin_sources(tx, data).await?;

        blocks::insert_transactions(tx, &data.transactions).await?;
        if !self.storage.dialect().insert_preserves_version() {
            blocks::set_transaction_versions(tx, &data.transactions).await?;
        }

        blocks::insert_vins(tx, &data.vins).await?;
        blocks::apply_block_aggregates(tx, data).await?;

        if let Some(omni) = &self.omni {
            data.omni_transactions = omni.get_omni_block(height).await?;
            blocks::insert_omni_transactions(tx, &data.omni_transactions).await?;
            tether::update_tether_address(tx, omni.as_ref(), data).await?;
        }

        Ok(SaveOutcome::Committed)
    }

    /// Advance the overlay store to the chain tip before live ingestion.
    ///
    /// Each height gets its own transaction so an interrupted backfill
    /// resumes where it stopped.
    pub async fn make_up_omni(&self) -> Result<()> {
        let Some(omni) = &self.omni else {
            return Ok(());
        };

        let max_overlay = blocks::max_omni_height(self.storage.pool()).await?;
        let Some(tip) = blocks::tip_block(self.storage.pool()).await? else {
            debug!("no blocks stored, skipping overlay backfill");
            return Ok(());
        };

        let start = max_overlay.unwrap_or(self.min_omni_block_height);
        if start >= tip.height {
            return Ok(());
        }
        info!(
            from = start + 1,
            to = tip.height,
            "backfilling overlay state"
        );

        for height in (start + 1)..=tip.height {
            let mut tx = self.storage.begin().await?;
            match backfill_height(&mut tx, omni.as_ref(), height).await {
                Ok(()) => {
                    tx.commit()
                        .await
                        .with_context(|| format!("failed to commit overlay height {}", height))?;
                    debug!(height, "overlay height reconciled");
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn drain_gap_notices(&mut self) {
        while let Ok(height) = self.gap_notices.try_recv() {
            self.missed_blocks.insert(height);
        }
    }
}

async fn backfill_height(
    tx: &mut Transaction<'_, Any>,
    omni: &dyn OmniApi,
    height: i64,
) -> Result<()> {
    let transactions = omni.get_omni_block(height).await?;
    if transactions.is_empty() {
        return Ok(());
    }

    // The block row may predate the overlay store; derive the timestamp
    // from the overlay transactions themselves.
    let stub = BlockData {
        block: Block {
            height,
            timestamp: transactions[0].timestamp,
            ..Default::default()
        },
        omni_transactions: transactions,
        ..Default::default()
    };

    blocks::insert_omni_transactions(tx, &stub.omni_transactions).await?;
    tether::update_tether_address(tx, omni, &stub).await
}

/// Attribute the block to a miner via the coinbase payout address.
fn fill_block_miner(data: &mut BlockData) {
    if let Some(address) = data.coinbase_address() {
        data.block.miner = address.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsink_core::{OmniTransaction, Transaction as TxRow, VIn, VOut};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct SilentNode;

    #[async_trait]
    impl NodeApi for SilentNode {
        async fn send_batch_block(&self, _start: i64, _end: i64) -> Result<()> {
            Ok(())
        }
    }

    struct ScriptedOmni {
        blocks: Mutex<HashMap<i64, Vec<OmniTransaction>>>,
    }

    impl ScriptedOmni {
        fn new(entries: Vec<(i64, Vec<OmniTransaction>)>) -> Arc<Self> {
            Arc::new(Self {
                blocks: Mutex::new(entries.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl OmniApi for ScriptedOmni {
        async fn get_omni_block(&self, height: i64) -> Result<Vec<OmniTransaction>> {
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .get(&height)
                .cloned()
                .unwrap_or_default())
        }

        async fn get_tether_balance(&self, _address: &str) -> Result<Decimal> {
            Ok(Decimal::TEN)
        }
    }

    fn test_config(omni_enable: bool) -> Config {
        let mut toml = String::from(
            r#"
[database]
url = "sqlite://ignored.db"

[bus]
topic = "btc_block"

[node]
endpoint = "http://127.0.0.1:8332"
"#,
        );
        if omni_enable {
            toml.push_str(
                "\n[omni]\nenable = true\nendpoint = \"http://127.0.0.1:18332\"\nmin_block_height = 0\n",
            );
        }
        Config::from_toml_str(&toml).unwrap()
    }

    fn chain_block(height: i64) -> BlockData {
        BlockData {
            block: Block {
                height,
                hash: format!("h{}", height),
                previous_hash: format!("h{}", height - 1),
                timestamp: 1000 + height,
                version: 1,
                miner: String::new(),
            },
            transactions: vec![TxRow {
                tx_hash: format!("cb{}", height),
                block_height: height,
                version: 2,
            }],
            vins: vec![VIn {
                tx_hash: format!("cb{}", height),
                block_height: height,
                prev_tx_hash: String::new(),
                prev_index: -1,
                address: String::new(),
                value: 0,
            }],
            vouts: vec![VOut {
                tx_hash: format!("cb{}", height),
                index: 0,
                block_height: height,
                address: format!("pool{}", height % 2),
                value: 50,
                is_used: false,
            }],
            omni_transactions: vec![],
        }
    }

    async fn setup_ingestor(omni: Option<Arc<dyn OmniApi>>) -> (Ingestor, Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::connect_with_path(temp_db.path()).await.unwrap();
        storage.run_migrations().await.unwrap();

        let config = test_config(omni.is_some());
        let (_gap_tx, gap_rx) = mpsc::channel(8);
        let ingestor = Ingestor::new(
            &config,
            storage.clone(),
            Arc::new(SilentNode),
            omni,
            Arc::new(PipelineStats::default()),
            gap_rx,
        )
        .unwrap();

        (ingestor, storage, temp_db)
    }

    #[tokio::test]
    async fn save_is_idempotent_for_duplicates() {
        let (ingestor, storage, _temp_db) = setup_ingestor(None).await;

        let mut data = chain_block(50);
        ingestor.save_block(&mut data).await.unwrap();
        let mut again = chain_block(50);
        ingestor.save_block(&mut again).await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.transaction_count, 1);
        assert_eq!(stats.tip_height, Some(50));
    }

    #[tokio::test]
    async fn genesis_is_stored_once() {
        let (ingestor, storage, _temp_db) = setup_ingestor(None).await;

        let mut genesis = chain_block(0);
        genesis.block.previous_hash = String::new();
        ingestor.save_block(&mut genesis).await.unwrap();

        let mut replay = chain_block(0);
        replay.block.previous_hash = String::new();
        replay.block.hash = "h0-competing".into();
        ingestor.save_block(&mut replay).await.unwrap();

        let stored = blocks::block_at_height(storage.pool(), 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.hash, "h0");
    }

    #[tokio::test]
    async fn too_old_fork_is_dropped_without_writes() {
        let (ingestor, storage, _temp_db) = setup_ingestor(None).await;

        for height in 100..=120 {
            let mut data = chain_block(height);
            ingestor.save_block(&mut data).await.unwrap();
        }

        let mut fork = chain_block(100);
        fork.block.hash = "h100-fork".into();
        ingestor.save_block(&mut fork).await.unwrap();

        let stored = blocks::block_at_height(storage.pool(), 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.hash, "h100");
        assert_eq!(storage.stats().await.unwrap().tip_height, Some(120));
    }

    #[tokio::test]
    async fn miner_is_attributed_from_coinbase() {
        let (ingestor, storage, _temp_db) = setup_ingestor(None).await;

        let mut data = chain_block(7);
        ingestor.save_block(&mut data).await.unwrap();

        let stored = blocks::block_at_height(storage.pool(), 7)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.miner, "pool1");
    }

    #[tokio::test]
    async fn backfill_advances_overlay_to_the_tip() {
        let omni_txs = vec![OmniTransaction {
            tx_hash: "omni-2".into(),
            block_height: 2,
            timestamp: 1002,
            sending_address: "s1".into(),
            reference_address: "r1".into(),
            property_id: 31,
            amount: Decimal::ONE,
            tx_type: "Simple Send".into(),
            valid: true,
        }];
        let omni = ScriptedOmni::new(vec![(2, omni_txs)]);
        let (ingestor, storage, _temp_db) =
            setup_ingestor(Some(omni as Arc<dyn OmniApi>)).await;

        // Three blocks are stored but no overlay rows yet.
        for height in 1..=3 {
            let data = chain_block(height);
            let mut tx = storage.begin().await.unwrap();
            blocks::insert_block(&mut tx, &data.block).await.unwrap();
            blocks::insert_vouts(&mut tx, &data.vouts).await.unwrap();
            blocks::insert_transactions(&mut tx, &data.transactions)
                .await
                .unwrap();
            blocks::insert_vins(&mut tx, &data.vins).await.unwrap();
            tx.commit().await.unwrap();
        }

        ingestor.make_up_omni().await.unwrap();

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.omni_transaction_count, 1);
        assert_eq!(stats.max_omni_height, Some(2));
        assert_eq!(stats.tether_address_count, 2);
        assert!(stats.max_omni_height.unwrap() <= stats.tip_height.unwrap());
    }

    #[tokio::test]
    async fn backfill_without_blocks_is_a_no_op() {
        let omni = ScriptedOmni::new(vec![]);
        let (ingestor, storage, _temp_db) =
            setup_ingestor(Some(omni as Arc<dyn OmniApi>)).await;

        ingestor.make_up_omni().await.unwrap();
        assert_eq!(storage.stats().await.unwrap().omni_transaction_count, 0);
    }
}
