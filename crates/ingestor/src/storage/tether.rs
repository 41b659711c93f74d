//! Overlay address reconciliation.
//!
//! The `btc_tether_address` table keeps one row per overlay address with its
//! birth block timestamp, the timestamp of the latest block touching it, and
//! the balance the overlay node reports. Both entry points run inside the
//! caller's store transaction; balances are fetched over RPC while it is
//! open, mirroring the persistence flow they are part of.

use anyhow::{Context, Result};
use chainsink_core::{BlockData, TetherAddress};
use rust_decimal::Decimal;
use sqlx::{Any, Row, Transaction};
use std::collections::HashSet;
use tracing::debug;

use crate::rpc::OmniApi;

const TOUCHED_ADDRESSES: &str = "SELECT sending_address FROM btc_omni_transaction \
     WHERE block_height = $1 \
     UNION \
     SELECT reference_address FROM btc_omni_transaction WHERE block_height = $1";

async fn insert_tether_addresses(
    tx: &mut Transaction<'_, Any>,
    addresses: &[TetherAddress],
) -> Result<()> {
    for entry in addresses {
        sqlx::query(
            "INSERT INTO btc_tether_address \
             (address, birth_timestamp, latest_tx_timestamp, value) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.address)
        .bind(entry.birth_timestamp)
        .bind(entry.latest_tx_timestamp)
        .bind(entry.value.to_string())
        .execute(&mut **tx)
        .await
        .with_context(|| format!("failed to insert overlay address {}", entry.address))?;
    }

    Ok(())
}

/// Refresh the overlay address aggregates for a block.
///
/// Addresses already known keep their birth timestamp and get this block's
/// timestamp as their latest; addresses first seen here are born now. Every
/// touched row gets its balance re-read from the overlay node.
pub async fn update_tether_address(
    tx: &mut Transaction<'_, Any>,
    omni: &dyn OmniApi,
    data: &BlockData,
) -> Result<()> {
    let height = data.block.height;
    let mut address_list: Vec<TetherAddress> = Vec::new();
    let mut known: HashSet<String> = HashSet::new();

    let rows = sqlx::query(&format!(
        "SELECT address, birth_timestamp FROM btc_tether_address \
         WHERE address IN ({})",
        TOUCHED_ADDRESSES
    ))
    .bind(height)
    .fetch_all(&mut **tx)
    .await
    .with_context(|| format!("failed to read overlay addresses touched by block {}", height))?;

    for row in rows {
        let address: String = row.get("address");
        if address.is_empty() {
            continue;
        }
        known.insert(address.clone());
        address_list.push(TetherAddress {
            address,
            birth_timestamp: row.get("birth_timestamp"),
            latest_tx_timestamp: data.block.timestamp,
            value: Decimal::ZERO,
        });
    }

    sqlx::query(&format!(
        "DELETE FROM btc_tether_address WHERE address IN ({})",
        TOUCHED_ADDRESSES
    ))
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to clear overlay addresses touched by block {}", height))?;

    for omni_tx in &data.omni_transactions {
        for address in [&omni_tx.sending_address, &omni_tx.reference_address] {
            if address.is_empty() || known.contains(address.as_str()) {
                continue;
            }
            known.insert(address.clone());
            address_list.push(TetherAddress {
                address: address.clone(),
                birth_timestamp: data.block.timestamp,
                latest_tx_timestamp: data.block.timestamp,
                value: Decimal::ZERO,
            });
        }
    }

    for entry in &mut address_list {
        entry.value = omni.get_tether_balance(&entry.address).await?;
    }

    debug!(
        height,
        addresses = address_list.len(),
        "overlay addresses refreshed"
    );
    insert_tether_addresses(tx, &address_list).await
}

/// Undo the overlay address changes of a reverted height.
///
/// Rows born in the reverted block are dropped; rows merely touched by it
/// are reinserted with their stored timestamps and a balance re-read from
/// the overlay node. Must run while the block's rows are still stored.
pub async fn revert_tether_address(
    tx: &mut Transaction<'_, Any>,
    omni: &dyn OmniApi,
    height: i64,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM btc_tether_address \
         WHERE birth_timestamp = (SELECT timestamp FROM btc_block WHERE height = $1)",
    )
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to drop overlay addresses born in block {}", height))?;

    let rows = sqlx::query(&format!(
        "SELECT address, birth_timestamp, latest_tx_timestamp FROM btc_tether_address \
         WHERE address IN ({})",
        TOUCHED_ADDRESSES
    ))
    .bind(height)
    .fetch_all(&mut **tx)
    .await
    .with_context(|| format!("failed to read overlay addresses touched by block {}", height))?;

    let mut address_list: Vec<TetherAddress> = Vec::new();
    for row in rows {
        let address: String = row.get("address");
        if address.is_empty() {
            continue;
        }
        address_list.push(TetherAddress {
            address,
            birth_timestamp: row.get("birth_timestamp"),
            latest_tx_timestamp: row.get("latest_tx_timestamp"),
            value: Decimal::ZERO,
        });
    }

    sqlx::query(&format!(
        "DELETE FROM btc_tether_address WHERE address IN ({})",
        TOUCHED_ADDRESSES
    ))
    .bind(height)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to clear overlay addresses touched by block {}", height))?;

    for entry in &mut address_list {
        entry.value = omni.get_tether_balance(&entry.address).await?;
    }

    insert_tether_addresses(tx, &address_list).await
}
