//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Block height is negative.
    #[error("Invalid block height: {0}")]
    InvalidHeight(i64),

    /// Block carries an empty hash.
    #[error("Block {0} has an empty hash")]
    EmptyBlockHash(i64),

    /// A transaction in the block carries an empty hash.
    #[error("Block {0} contains a transaction with an empty hash")]
    EmptyTxHash(i64),

    /// An output references an index that is out of order for its transaction.
    #[error("Block {height} output {tx_hash}:{index} has a negative index")]
    InvalidOutputIndex {
        /// Height of the offending block.
        height: i64,
        /// Transaction the output belongs to.
        tx_hash: String,
        /// The offending output index.
        index: i64,
    },
}

/// Result type alias for CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
