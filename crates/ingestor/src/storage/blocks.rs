//! Row operations for the block tables.
//!
//! Everything that runs inside the per-block persistence transaction lives
//! here: batch inserts, input resolution, the address/vout aggregates of
//! `apply_block_aggregates` and their inverse in `revert_block`.

use anyhow::{Context, Result};
use chainsink_core::{Block, BlockData, OmniTransaction, Transaction as TxRow, VIn, VOut};
use sqlx::{Any, Executor, Row, Transaction};
use tracing::debug;

use super::log_affected;

fn row_to_block(row: sqlx::any::AnyRow) -> Block {
    Block {
        height: row.get("height"),
        hash: row.get("hash"),
        previous_hash: row.get("previous_hash"),
        timestamp: row.get("timestamp"),
        version: row.get("version"),
        miner: row.get("miner"),
    }
}

/// Fetch the block stored at `height`.
pub async fn block_at_height<'e, E>(executor: E, height: i64) -> Result<Option<Block>>
where
    E: Executor<'e, Database = Any>,
{
    let row = sqlx::query(
        "SELECT height, hash, previous_hash, timestamp, version, miner \
         FROM btc_block WHERE height = $1",
    )
    .bind(height)
    .fetch_optional(executor)
    .await
    .with_context(|| format!("failed to fetch block {}", height))?;

    Ok(row.map(row_to_block))
}

/// Fetch the highest stored block, if any.
pub async fn tip_block<'e, E>(executor: E) -> Result<Option<Block>>
where
    E: Executor<'e, Database = Any>,
{
    let row = sqlx::query(
        "SELECT height, hash, previous_hash, timestamp, version, miner \
         FROM btc_block ORDER BY height DESC LIMIT 1",
    )
    .fetch_optional(executor)
    .await
    .context("failed to fetch tip block")?;

    Ok(row.map(row_to_block))
}

/// Highest overlay transaction height, if any overlay row is stored.
pub async fn max_omni_height<'e, E>(executor: E) -> Result<Option<i64>>
where
    E: Executor<'e, Database = Any>,
{
    let height: Option<i64> =
        sqlx::query_scalar("SELECT MAX(block_height) FROM btc_omni_transaction")
            .fetch_one(executor)
            .await
            .context("failed to fetch max overlay height")?;

    Ok(height)
}

/// Insert the block header row.
pub async fn insert_block(tx: &mut Transaction<'_, Any>, block: &Block) -> Result<()> {
    sqlx::query(
        "INSERT INTO btc_block (height, hash, previous_hash, timestamp, version, miner) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(block.height)
    .bind(&block.hash)
    .bind(&block.previous_hash)
    .bind(block.timestamp)
    .bind(block.version)
    .bind(&block.miner)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert block {}", block.height))?;

    Ok(())
}

/// Insert the transaction rows of a block.
pub async fn insert_transactions(
    tx: &mut Transaction<'_, Any>,
    transactions: &[TxRow],
) -> Result<()> {
    for transaction in transactions {
        sqlx::query(
            "INSERT INTO btc_transaction (tx_hash, block_height, version) VALUES ($1, $2, $3)",
        )
        .bind(&transaction.tx_hash)
        .bind(transaction.block_height)
        .bind(transaction.version)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to insert transaction {}", transaction.tx_hash))?;
    }

    Ok(())
}

/// Insert the input rows of a block.
pub async fn insert_vins(tx: &mut Transaction<'_, Any>, vins: &[VIn]) -> Result<()> {
    for vin in vins {
        sqlx::query(
            "INSERT INTO btc_vin \
             (tx_hash, block_height, prev_tx_hash, prev_index, address, value) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&vin.tx_hash)
        .bind(vin.block_height)
        .bind(&vin.prev_tx_hash)
        .bind(vin.prev_index)
        .bind(&vin.address)
        .bind(vin.value)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to insert input of {}", vin.tx_hash))?;
    }

    Ok(())
}

/// Insert the output rows of a block.
pub async fn insert_vouts(tx: &mut Transaction<'_, Any>, vouts: &[VOut]) -> Result<()> {
    for vout in vouts {
        sqlx::query(
            "INSERT INTO btc_vout (tx_hash, idx, block_height, address, value, is_used) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&vout.tx_hash)
        .bind(vout.index)
        .bind(vout.block_height)
        .bind(&vout.address)
        .bind(vout.value)
        .bind(vout.is_used)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to insert output {}:{}", vout.tx_hash, vout.index))?;
    }

    Ok(())
}

/// Insert the overlay transaction rows of a block.
pub async fn insert_omni_transactions(
    tx: &mut Transaction<'_, Any>,
    transactions: &[OmniTransaction],
) -> Result<()> {
    for omni in transactions {
        sqlx::query(
            "INSERT INTO btc_omni_transaction \
             (tx_hash, block_height, timestamp, sending_address, reference_address, \
              property_id, amount, tx_type, valid) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&omni.tx_hash)
        .bind(omni.block_height)
        .bind(omni.timestamp)
        .bind(&omni.sending_address)
        .bind(&omni.reference_address)
        .bind(omni.property_id)
        .bind(omni.amount.to_string())
        .bind(&omni.tx_type)
        .bind(omni.valid)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to insert overlay transaction {}", omni.tx_hash))?;
    }

    Ok(())
}

/// Denormalize address and value onto each non-coinbase input by looking up
/// the output it consumes. Outputs of the block itself were inserted first,
/// so intra-block spends resolve as well.
pub async fn resolve_vin_sources(
    tx: &mut Transaction<'_, Any>,
    data: &mut BlockData,
) -> Result<()> {
    for vin in data.vins.iter_mut().filter(|vin| !vin.is_coinbase()) {
        let source = sqlx::query("SELECT address, value FROM btc_vout WHERE tx_hash = $1 AND idx = $2")
            .bind(&vin.prev_tx_hash)
            .bind(vin.prev_index)
            .fetch_optional(&mut **tx)
            .await
            .with_context(|| {
                format!(
                    "failed to resolve input {}:{}",
                    vin.prev_tx_hash, vin.prev_index
                )
            })?;

        match source {
            Some(row) => {
                vin.address = row.get("address");
                vin.value = row.get("value");
            }
            None => {
                debug!(
                    prev_tx = %vin.prev_tx_hash,
                    prev_index = vin.prev_index,
                    "input references an unknown output"
                );
            }
        }
    }

    Ok(())
}

/// Rewrite the `version` column of a block row. Needed on backends whose
/// insert path does not round-trip the column.
pub async fn set_block_version(tx: &mut Transaction<'_, Any>, block: &Block) -> Result<()> {
    sqlx::query("UPDATE btc_block SET version = $1 WHERE height = $2")
        .bind(block.version)
        .bind(block.height)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to patch version of block {}", block.height))?;

    Ok(())
}

/// Rewrite the `version` column of each transaction row. Same dialect
/// workaround as [`set_block_version`].
pub async fn set_transaction_versions(
    tx: &mut Transaction<'_, Any>,
    transactions: &[TxRow],
) -> Result<()> {
    for transaction in transactions {
        sqlx::query(
            "UPDATE btc_transaction SET version = $1 WHERE tx_hash = $2 AND block_height = $3",
        )
        .bind(transaction.version)
        .bind(&transaction.tx_hash)
        .bind(transaction.block_height)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to patch version of {}", transaction.tx_hash))?;
    }

    Ok(())
}

/// Apply the per-block aggregates after the row inserts: mark consumed
/// outputs, move address balances, and credit the miner's coinbase counter.
pub async fn apply_block_aggregates(
    tx: &mut Transaction<'_, Any>,
    data: &BlockData,
) -> Result<()> {
    let height = data.block.height;

    let marked = sqlx::query(
        "UPDATE btc_vout SET is_used = TRUE \
         WHERE EXISTS (\
            SELECT 1 FROM btc_vin \
            WHERE btc_vin.block_height = $1 \
              AND btc_vin.prev_tx_hash = btc_vout.tx_hash \
              AND btc_vin.prev_index = btc_vout.idx)",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to mark outputs consumed by block {}", height))?;
    log_affected("outputs marked consumed", height, &marked);

    sqlx::query(
        "INSERT INTO btc_address (address, value, coinbase_times) \
         SELECT address, SUM(value), 0 FROM btc_vout \
         WHERE block_height = $1 AND address <> '' \
         GROUP BY address \
         ON CONFLICT (address) DO UPDATE SET value = btc_address.value + excluded.value",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to credit output addresses of block {}", height))?;

    sqlx::query(
        "INSERT INTO btc_address (address, value, coinbase_times) \
         SELECT address, -SUM(value), 0 FROM btc_vin \
         WHERE block_height = $1 AND address <> '' \
         GROUP BY address \
         ON CONFLICT (address) DO UPDATE SET value = btc_address.value + excluded.value",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to debit input addresses of block {}", height))?;

    if !data.block.miner.is_empty() {
        sqlx::query(
            "INSERT INTO btc_address (address, value, coinbase_times) VALUES ($1, 0, 1) \
             ON CONFLICT (address) DO UPDATE \
             SET coinbase_times = btc_address.coinbase_times + 1",
        )
        .bind(&data.block.miner)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to credit miner of block {}", height))?;
    }

    Ok(())
}

/// Undo everything `apply_block_aggregates` did for `height`. Must run
/// while the block's rows are still present.
async fn revert_block_aggregates(tx: &mut Transaction<'_, Any>, height: i64) -> Result<()> {
    let unmarked = sqlx::query(
        "UPDATE btc_vout SET is_used = FALSE \
         WHERE EXISTS (\
            SELECT 1 FROM btc_vin \
            WHERE btc_vin.block_height = $1 \
              AND btc_vin.prev_tx_hash = btc_vout.tx_hash \
              AND btc_vin.prev_index = btc_vout.idx)",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to unmark outputs consumed by block {}", height))?;
    log_affected("outputs unmarked", height, &unmarked);

    sqlx::query(
        "INSERT INTO btc_address (address, value, coinbase_times) \
         SELECT address, -SUM(value), 0 FROM btc_vout \
         WHERE block_height = $1 AND address <> '' \
         GROUP BY address \
         ON CONFLICT (address) DO UPDATE SET value = btc_address.value + excluded.value",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to revert output credits of block {}", height))?;

    sqlx::query(
        "INSERT INTO btc_address (address, value, coinbase_times) \
         SELECT address, SUM(value), 0 FROM btc_vin \
         WHERE block_height = $1 AND address <> '' \
         GROUP BY address \
         ON CONFLICT (address) DO UPDATE SET value = btc_address.value + excluded.value",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to revert input debits of block {}", height))?;

    sqlx::query(
        "UPDATE btc_address SET coinbase_times = coinbase_times - 1 \
         WHERE address = (SELECT miner FROM btc_block WHERE height = $1)",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to revert miner credit of block {}", height))?;

    Ok(())
}

/// Revert a single height: undo the aggregates, then delete every row
/// keyed on it.
pub async fn revert_block(tx: &mut Transaction<'_, Any>, height: i64) -> Result<()> {
    revert_block_aggregates(tx, height).await?;

    for (table, sql) in [
        ("btc_block", "DELETE FROM btc_block WHERE height = $1"),
        (
            "btc_transaction",
            "DELETE FROM btc_transaction WHERE block_height = $1",
        ),
        ("btc_vin", "DELETE FROM btc_vin WHERE block_height = $1"),
        ("btc_vout", "DELETE FROM btc_vout WHERE block_height = $1"),
        (
            "btc_omni_transaction",
            "DELETE FROM btc_omni_transaction WHERE block_height = $1",
        ),
    ] {
        let deleted = sqlx::query(sql)
            .bind(height)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("failed to delete {} rows at height {}", table, height))?;
        log_affected(table, height, &deleted);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::NamedTempFile;

    async fn setup_storage() -> (Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::connect_with_path(temp_db.path()).await.unwrap();
        storage.run_migrations().await.unwrap();
        (storage, temp_db)
    }

    fn parent_block() -> BlockData {
        BlockData {
            block: Block {
                height: 99,
                hash: "h99".into(),
                previous_hash: "h98".into(),
                timestamp: 1000,
                version: 1,
                miner: "pool-a".into(),
            },
            transactions: vec![TxRow {
                tx_hash: "tx0".into(),
                block_height: 99,
                version: 2,
            }],
            vins: vec![VIn {
                tx_hash: "tx0".into(),
                block_height: 99,
                prev_tx_hash: String::new(),
                prev_index: -1,
                address: String::new(),
                value: 0,
            }],
            vouts: vec![VOut {
                tx_hash: "tx0".into(),
                index: 0,
                block_height: 99,
                address: "alice".into(),
                value: 100,
                is_used: false,
            }],
            omni_transactions: vec![],
        }
    }

    fn spending_block() -> BlockData {
        BlockData {
            block: Block {
                height: 100,
                hash: "h100".into(),
                previous_hash: "h99".into(),
                timestamp: 1600,
                version: 1,
                miner: "pool-b".into(),
            },
            transactions: vec![TxRow {
                tx_hash: "tx1".into(),
                block_height: 100,
                version: 2,
            }],
            vins: vec![VIn {
                tx_hash: "tx1".into(),
                block_height: 100,
                prev_tx_hash: "tx0".into(),
                prev_index: 0,
                address: String::new(),
                value: 0,
            }],
            vouts: vec![VOut {
                tx_hash: "tx1".into(),
                index: 0,
                block_height: 100,
                address: "bob".into(),
                value: 100,
                is_used: false,
            }],
            omni_transactions: vec![],
        }
    }

    async fn apply(storage: &Storage, data: &mut BlockData) {
        let mut tx = storage.begin().await.unwrap();
        insert_block(&mut tx, &data.block).await.unwrap();
        insert_vouts(&mut tx, &data.vouts).await.unwrap();
        resolve_vin_sources(&mut tx, data).await.unwrap();
        insert_transactions(&mut tx, &data.transactions).await.unwrap();
        insert_vins(&mut tx, &data.vins).await.unwrap();
        apply_block_aggregates(&mut tx, data).await.unwrap();
        tx.commit().await.unwrap();
    }

    async fn address_row(storage: &Storage, address: &str) -> Option<(i64, i64)> {
        sqlx::query("SELECT value, coinbase_times FROM btc_address WHERE address = $1")
            .bind(address)
            .fetch_optional(storage.pool())
            .await
            .unwrap()
            .map(|row| (row.get("value"), row.get("coinbase_times")))
    }

    async fn used_output_count(storage: &Storage) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM btc_vout WHERE is_used = TRUE")
            .fetch_one(storage.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn block_lookup_and_tip() {
        let (storage, _temp_db) = setup_storage().await;
        let mut parent = parent_block();
        apply(&storage, &mut parent).await;

        let stored = block_at_height(storage.pool(), 99).await.unwrap().unwrap();
        assert_eq!(stored.hash, "h99");
        assert_eq!(stored.miner, "pool-a");

        assert!(block_at_height(storage.pool(), 100).await.unwrap().is_none());
        assert_eq!(tip_block(storage.pool()).await.unwrap().unwrap().height, 99);
    }

    #[tokio::test]
    async fn spend_resolves_inputs_and_moves_balances() {
        let (storage, _temp_db) = setup_storage().await;
        let mut parent = parent_block();
        apply(&storage, &mut parent).await;
        let mut spend = spending_block();
        apply(&storage, &mut spend).await;

        // Input denormalized from the consumed output.
        assert_eq!(spend.vins[0].address, "alice");
        assert_eq!(spend.vins[0].value, 100);

        // Balance moved from alice to bob, consumed output marked.
        assert_eq!(address_row(&storage, "alice").await, Some((0, 0)));
        assert_eq!(address_row(&storage, "bob").await, Some((100, 0)));
        assert_eq!(address_row(&storage, "pool-b").await, Some((0, 1)));
        assert_eq!(used_output_count(&storage).await, 1);
    }

    #[tokio::test]
    async fn revert_restores_pre_block_state() {
        let (storage, _temp_db) = setup_storage().await;
        let mut parent = parent_block();
        apply(&storage, &mut parent).await;
        let mut spend = spending_block();
        apply(&storage, &mut spend).await;

        let mut tx = storage.begin().await.unwrap();
        revert_block(&mut tx, 100).await.unwrap();
        tx.commit().await.unwrap();

        assert!(block_at_height(storage.pool(), 100).await.unwrap().is_none());
        assert_eq!(tip_block(storage.pool()).await.unwrap().unwrap().height, 99);
        assert_eq!(address_row(&storage, "alice").await, Some((100, 0)));
        assert_eq!(address_row(&storage, "bob").await, Some((0, 0)));
        assert_eq!(address_row(&storage, "pool-b").await, Some((0, 0)));
        assert_eq!(used_output_count(&storage).await, 0);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM btc_vin WHERE block_height = 100")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn unknown_input_reference_is_tolerated() {
        let (storage, _temp_db) = setup_storage().await;
        let mut data = spending_block();
        data.vins[0].prev_tx_hash = "missing".into();
        apply(&storage, &mut data).await;

        assert_eq!(data.vins[0].address, "");
        assert_eq!(data.vins[0].value, 0);
    }

    #[tokio::test]
    async fn overlay_rows_round_trip() {
        let (storage, _temp_db) = setup_storage().await;
        let omni = OmniTransaction {
            tx_hash: "omni-1".into(),
            block_height: 252_400,
            timestamp: 2000,
            sending_address: "s1".into(),
            reference_address: "r1".into(),
            property_id: 31,
            amount: "42.5".parse().unwrap(),
            tx_type: "Simple Send".into(),
            valid: true,
        };

        let mut tx = storage.begin().await.unwrap();
        insert_omni_transactions(&mut tx, &[omni]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            max_omni_height(storage.pool()).await.unwrap(),
            Some(252_400)
        );
    }
}
