//! Decoder for the pre-parsed block payloads delivered over the bus.
//!
//! The upstream node has already decoded raw block bytes and scripts; the
//! payload is a normalized JSON document. Decoding here is flattening: the
//! nested transaction/input/output arrays become the row vectors of
//! [`BlockData`], each stamped with the carrying block height.

use anyhow::{Context, Result};
use chainsink_core::{Block, BlockData, Transaction, VIn, VOut};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RawBlock {
    height: i64,
    hash: String,
    #[serde(default)]
    previous_hash: String,
    timestamp: i64,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    transactions: Vec<RawTransaction>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    tx_hash: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    vin: Vec<RawVIn>,
    #[serde(default)]
    vout: Vec<RawVOut>,
}

#[derive(Debug, Deserialize)]
struct RawVIn {
    /// Empty for a coinbase input.
    #[serde(default)]
    prev_tx_hash: String,
    #[serde(default = "negative_one")]
    prev_index: i64,
}

#[derive(Debug, Deserialize)]
struct RawVOut {
    index: i64,
    #[serde(default)]
    address: String,
    #[serde(default)]
    value: i64,
}

fn negative_one() -> i64 {
    -1
}

/// Parse a bus payload into a decomposed block.
pub fn parse_block(payload: &str) -> Result<BlockData> {
    let raw: RawBlock =
        serde_json::from_str(payload).context("block payload is not a valid block document")?;

    let height = raw.height;
    let mut data = BlockData {
        block: Block {
            height,
            hash: raw.hash,
            previous_hash: raw.previous_hash,
            timestamp: raw.timestamp,
            version: raw.version,
            miner: String::new(),
        },
        ..Default::default()
    };

    for tx in raw.transactions {
        for vin in &tx.vin {
            data.vins.push(VIn {
                tx_hash: tx.tx_hash.clone(),
                block_height: height,
                prev_tx_hash: vin.prev_tx_hash.clone(),
                prev_index: vin.prev_index,
                address: String::new(),
                value: 0,
            });
        }
        for vout in &tx.vout {
            data.vouts.push(VOut {
                tx_hash: tx.tx_hash.clone(),
                index: vout.index,
                block_height: height,
                address: vout.address.clone(),
                value: vout.value,
                is_used: false,
            });
        }
        data.transactions.push(Transaction {
            tx_hash: tx.tx_hash,
            block_height: height,
            version: tx.version,
        });
    }

    data.validate()
        .with_context(|| format!("block {} failed structural validation", height))?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> String {
        serde_json::json!({
            "height": 100,
            "hash": "h100",
            "previous_hash": "h99",
            "timestamp": 1_700_000_000_i64,
            "version": 0x2000_0000_i64,
            "transactions": [
                {
                    "tx_hash": "cb100",
                    "version": 2,
                    "vin": [{ "prev_tx_hash": "", "prev_index": -1 }],
                    "vout": [
                        { "index": 0, "address": "pool", "value": 625_000_000_i64 }
                    ]
                },
                {
                    "tx_hash": "tx1",
                    "version": 2,
                    "vin": [{ "prev_tx_hash": "tx0", "prev_index": 1 }],
                    "vout": [
                        { "index": 0, "address": "alice", "value": 70_000_000_i64 },
                        { "index": 1, "address": "bob", "value": 20_000_000_i64 }
                    ]
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn flattens_transactions_into_rows() {
        let data = parse_block(&payload()).unwrap();
        assert_eq!(data.block.height, 100);
        assert_eq!(data.block.hash, "h100");
        assert_eq!(data.transactions.len(), 2);
        assert_eq!(data.vins.len(), 2);
        assert_eq!(data.vouts.len(), 3);
        assert!(data.vins[0].is_coinbase());
        assert_eq!(data.vouts[2].address, "bob");
        assert!(data.vouts.iter().all(|v| v.block_height == 100));
    }

    #[test]
    fn unresolved_inputs_start_without_address_or_value() {
        let data = parse_block(&payload()).unwrap();
        let spend = &data.vins[1];
        assert_eq!(spend.prev_tx_hash, "tx0");
        assert_eq!(spend.prev_index, 1);
        assert_eq!(spend.address, "");
        assert_eq!(spend.value, 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_block("not json at all").is_err());
        assert!(parse_block("{\"height\": 1}").is_err());
    }

    #[test]
    fn rejects_structurally_invalid_block() {
        let doc = serde_json::json!({
            "height": -5,
            "hash": "h",
            "timestamp": 0,
        })
        .to_string();
        let err = parse_block(&doc).unwrap_err();
        assert!(err.to_string().contains("structural validation"));
    }
}
