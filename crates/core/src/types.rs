//! Row-level domain types for the decomposed block model.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A block header row.
///
/// `hash` uniquely identifies a block and at most one block is stored per
/// height. Every stored block above height 0 links to a stored parent whose
/// hash equals `previous_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    /// Chain height of the block.
    pub height: i64,

    /// Block hash (hex string).
    pub hash: String,

    /// Hash of the parent block. Empty for the genesis block.
    pub previous_hash: String,

    /// Block timestamp (unix seconds).
    pub timestamp: i64,

    /// Consensus version field of the header.
    pub version: i64,

    /// Resolved miner identity. Empty until the miner helper fills it.
    pub miner: String,
}

/// A transaction row. Belongs to exactly one block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    /// Transaction hash (hex string).
    pub tx_hash: String,

    /// Height of the block the transaction appears in.
    pub block_height: i64,

    /// Transaction version.
    pub version: i64,
}

/// A transaction input row.
///
/// References the consumed output by `(prev_tx_hash, prev_index)`. Address
/// and value are denormalized copies of the referenced output, resolved
/// during persistence. A coinbase input has an empty `prev_tx_hash`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VIn {
    /// Transaction this input belongs to.
    pub tx_hash: String,

    /// Height of the block the input appears in.
    pub block_height: i64,

    /// Hash of the transaction whose output is consumed.
    pub prev_tx_hash: String,

    /// Index of the consumed output within its transaction.
    pub prev_index: i64,

    /// Address of the consumed output, once resolved.
    pub address: String,

    /// Value of the consumed output in satoshis, once resolved.
    pub value: i64,
}

impl VIn {
    /// Whether this input mints new coins rather than consuming an output.
    pub fn is_coinbase(&self) -> bool {
        self.prev_tx_hash.is_empty()
    }
}

/// A transaction output row. `(tx_hash, index)` is unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VOut {
    /// Transaction this output belongs to.
    pub tx_hash: String,

    /// Output index within the transaction.
    pub index: i64,

    /// Height of the block the output appears in.
    pub block_height: i64,

    /// Receiving address. May be empty for non-standard scripts.
    pub address: String,

    /// Output value in satoshis.
    pub value: i64,

    /// True iff a stored input references this output.
    pub is_used: bool,
}

/// An overlay (Omni layer) transaction, as reported by the overlay node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OmniTransaction {
    /// Transaction hash (hex string).
    #[serde(rename = "txid")]
    pub tx_hash: String,

    /// Height of the carrying block.
    #[serde(rename = "block")]
    pub block_height: i64,

    /// Timestamp of the carrying block (unix seconds).
    #[serde(rename = "blocktime")]
    pub timestamp: i64,

    /// Sender of the overlay transfer. May be empty.
    #[serde(rename = "sendingaddress", default)]
    pub sending_address: String,

    /// Receiver of the overlay transfer. May be empty.
    #[serde(rename = "referenceaddress", default)]
    pub reference_address: String,

    /// Omni property the transfer moves.
    #[serde(rename = "propertyid", default)]
    pub property_id: i64,

    /// Transferred amount.
    #[serde(default)]
    pub amount: Decimal,

    /// Overlay transaction type label.
    #[serde(rename = "type", default)]
    pub tx_type: String,

    /// Whether the overlay node judged the transaction valid.
    #[serde(default)]
    pub valid: bool,
}

/// Per-address overlay aggregate.
///
/// `birth_timestamp` is the timestamp of the first block the address
/// appeared in; `latest_tx_timestamp` the latest such block; `value` the
/// balance the overlay node reports at the tip.
#[derive(Debug, Clone, PartialEq)]
pub struct TetherAddress {
    /// The overlay address.
    pub address: String,

    /// Timestamp of the first block mentioning the address.
    pub birth_timestamp: i64,

    /// Timestamp of the latest block mentioning the address.
    pub latest_tx_timestamp: i64,

    /// Balance reported by the overlay node.
    pub value: Decimal,
}

/// A fully decomposed block as produced by the decoder: the header plus the
/// flattened transaction, input and output rows, and (when the overlay is
/// enabled) the overlay transactions fetched during persistence.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    /// The block header.
    pub block: Block,

    /// All transactions of the block.
    pub transactions: Vec<Transaction>,

    /// All inputs, across every transaction.
    pub vins: Vec<VIn>,

    /// All outputs, across every transaction.
    pub vouts: Vec<VOut>,

    /// Overlay transactions at this height. Populated during persistence.
    pub omni_transactions: Vec<OmniTransaction>,
}

impl BlockData {
    /// Basic structural validation of a decoded block.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.block.height < 0 {
            return Err(CoreError::InvalidHeight(self.block.height));
        }
        if self.block.hash.is_empty() {
            return Err(CoreError::EmptyBlockHash(self.block.height));
        }
        for tx in &self.transactions {
            if tx.tx_hash.is_empty() {
                return Err(CoreError::EmptyTxHash(self.block.height));
            }
        }
        for vout in &self.vouts {
            if vout.index < 0 {
                return Err(CoreError::InvalidOutputIndex {
                    height: self.block.height,
                    tx_hash: vout.tx_hash.clone(),
                    index: vout.index,
                });
            }
        }
        Ok(())
    }

    /// Address credited by the coinbase transaction, used to attribute the
    /// block to a miner. Returns `None` when the coinbase output pays a
    /// non-standard script.
    pub fn coinbase_address(&self) -> Option<&str> {
        let coinbase_tx = self
            .vins
            .iter()
            .find(|vin| vin.is_coinbase())
            .map(|vin| vin.tx_hash.as_str())?;

        self.vouts
            .iter()
            .find(|vout| vout.tx_hash == coinbase_tx && !vout.address.is_empty())
            .map(|vout| vout.address.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> BlockData {
        BlockData {
            block: Block {
                height: 100,
                hash: "h100".into(),
                previous_hash: "h99".into(),
                timestamp: 1_700_000_000,
                version: 0x2000_0000,
                miner: String::new(),
            },
            transactions: vec![Transaction {
                tx_hash: "cb100".into(),
                block_height: 100,
                version: 2,
            }],
            vins: vec![VIn {
                tx_hash: "cb100".into(),
                block_height: 100,
                prev_tx_hash: String::new(),
                prev_index: -1,
                address: String::new(),
                value: 0,
            }],
            vouts: vec![VOut {
                tx_hash: "cb100".into(),
                index: 0,
                block_height: 100,
                address: "miner-pool".into(),
                value: 625_000_000,
                is_used: false,
            }],
            omni_transactions: vec![],
        }
    }

    #[test]
    fn validate_accepts_well_formed_block() {
        sample_block().validate().unwrap();
    }

    #[test]
    fn validate_rejects_negative_height() {
        let mut data = sample_block();
        data.block.height = -1;
        assert!(matches!(
            data.validate(),
            Err(CoreError::InvalidHeight(-1))
        ));
    }

    #[test]
    fn validate_rejects_empty_hash() {
        let mut data = sample_block();
        data.block.hash.clear();
        assert!(matches!(data.validate(), Err(CoreError::EmptyBlockHash(100))));
    }

    #[test]
    fn coinbase_address_follows_coinbase_input() {
        let data = sample_block();
        assert_eq!(data.coinbase_address(), Some("miner-pool"));
    }

    #[test]
    fn coinbase_address_skips_empty_outputs() {
        let mut data = sample_block();
        data.vouts[0].address.clear();
        assert_eq!(data.coinbase_address(), None);
    }

    #[test]
    fn omni_transaction_decodes_overlay_node_fields() {
        let raw = serde_json::json!({
            "txid": "omni-1",
            "block": 252400,
            "blocktime": 1_380_000_000_i64,
            "sendingaddress": "1Sender",
            "referenceaddress": "1Receiver",
            "propertyid": 31,
            "amount": "12.5",
            "type": "Simple Send",
            "valid": true
        });
        let tx: OmniTransaction = serde_json::from_value(raw).unwrap();
        assert_eq!(tx.block_height, 252_400);
        assert_eq!(tx.amount, Decimal::new(125, 1));
        assert!(tx.valid);
    }
}
