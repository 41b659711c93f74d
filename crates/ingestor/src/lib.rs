//! Block ingestion pipeline for a UTXO chain with an optional overlay layer.
//!
//! This crate consumes pre-parsed block messages from a durable message bus,
//! checks their linkage against the relational store, reconciles divergences
//! (reorganizations and gaps) by asking the upstream node to re-emit block
//! ranges onto the bus, and commits each block atomically.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  chainsink-ingestor                  │
//! │                                      │
//! │  ┌──────────────┐                    │
//! │  │ Bus consumer │ ← block messages   │
//! │  └──────┬───────┘                    │
//! │         │                            │
//! │  ┌──────▼───────┐  ┌──────────────┐  │
//! │  │  Controller  │──│ Schema check │  │
//! │  │  (tokio task)│  │  (advisory)  │  │
//! │  └──────┬───────┘  └──────────────┘  │
//! │         │                            │
//! │  ┌──────▼────────┐     re-emit      │
//! │  │ Linkage check │──────────────────┼──→ upstream node RPC
//! │  └──────┬────────┘                   │
//! │         │                            │
//! │  ┌──────▼────────────┐               │
//! │  │ Persistence (tx)  │ ← overlay RPC │
//! │  │ block / tx / vin  │               │
//! │  │ vout / omni /     │               │
//! │  │ tether aggregates │               │
//! │  └──────┬────────────┘               │
//! │         │                            │
//! │    offset commit                     │
//! │                                      │
//! │  ┌───────────────┐                   │
//! │  │  Cron worker  │  gap sweeps       │
//! │  │  (tokio task) │  → controller     │
//! │  └───────────────┘                   │
//! └──────────────────────────────────────┘
//! ```
//!
//! The controller is single-threaded per topic: a message is validated,
//! decoded, linkage-checked and persisted before the next one is looked at,
//! and its bus offset is committed only after the store transaction commits.
//! Redelivery is therefore harmless because the persistence path is
//! idempotent.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod cron;
pub mod decode;
pub mod ingest;
pub mod linkage;
pub mod metrics;
pub mod rpc;
pub mod schema;
pub mod storage;
