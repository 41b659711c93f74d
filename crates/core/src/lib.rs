//! # Chainsink Core
//!
//! Domain types shared by the chainsink ingestion pipeline: the decomposed
//! block model (block, transactions, inputs, outputs), the overlay-asset
//! rows (Omni transactions, Tether address aggregates) and the chain
//! constants the controller enforces.
//!
//! The types here are deliberately plain: they mirror the rows the ingestor
//! persists, not the wire encoding of the upstream node. Decoding from the
//! bus payload lives in the ingestor crate.

#![warn(missing_docs)]

pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::{CoreError, Result};
pub use types::*;
