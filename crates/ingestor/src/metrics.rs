//! Pipeline counters and liveness timestamps.
//!
//! Counters are emitted through the `metrics` facade under the
//! `chainsink_*` names and mirrored in process-local atomics so the
//! controller's progress is observable without an exporter (liveness
//! probes, the status command, tests).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Messages received from the bus.
pub const RECEIVE_MESSAGES: &str = "chainsink_receive_messages_total";
/// Payloads the decoder rejected.
pub const PARSE_DATA_ERROR: &str = "chainsink_parse_data_error_total";
/// Payloads that failed advisory schema validation.
pub const VALIDATION_ERROR: &str = "chainsink_validation_error_total";
/// Payloads that passed advisory schema validation.
pub const VALIDATION_SUCCESS: &str = "chainsink_validation_success_total";
/// Store transactions committed.
pub const DATABASE_COMMIT: &str = "chainsink_database_commit_total";
/// Store transactions rolled back.
pub const DATABASE_ROLLBACK: &str = "chainsink_database_rollback_total";
/// Heights reverted while applying reorganizations.
pub const REVERT_BLOCK: &str = "chainsink_revert_block_total";

/// Shared pipeline counters. One instance per controller, behind an `Arc`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    receive_messages: AtomicU64,
    parse_data_error: AtomicU64,
    validation_error: AtomicU64,
    validation_success: AtomicU64,
    database_commit: AtomicU64,
    database_rollback: AtomicU64,
    revert_block: AtomicU64,
    latest_receive_message: AtomicI64,
    latest_save_data: AtomicI64,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Messages received from the bus.
    pub receive_messages: u64,
    /// Payloads the decoder rejected.
    pub parse_data_error: u64,
    /// Payloads that failed schema validation.
    pub validation_error: u64,
    /// Payloads that passed schema validation.
    pub validation_success: u64,
    /// Store transactions committed.
    pub database_commit: u64,
    /// Store transactions rolled back.
    pub database_rollback: u64,
    /// Heights reverted while applying reorganizations.
    pub revert_block: u64,
    /// Unix timestamp of the last received message, 0 if none yet.
    pub latest_receive_message: i64,
    /// Unix timestamp of the last successful save, 0 if none yet.
    pub latest_save_data: i64,
}

impl PipelineStats {
    /// Register descriptions with the metrics recorder and zero the series.
    pub fn describe() {
        metrics::describe_counter!(
            RECEIVE_MESSAGES,
            metrics::Unit::Count,
            "Messages received from the bus"
        );
        metrics::describe_counter!(
            PARSE_DATA_ERROR,
            metrics::Unit::Count,
            "Payloads the decoder rejected"
        );
        metrics::describe_counter!(
            VALIDATION_ERROR,
            metrics::Unit::Count,
            "Payloads that failed advisory schema validation"
        );
        metrics::describe_counter!(
            VALIDATION_SUCCESS,
            metrics::Unit::Count,
            "Payloads that passed advisory schema validation"
        );
        metrics::describe_counter!(
            DATABASE_COMMIT,
            metrics::Unit::Count,
            "Store transactions committed"
        );
        metrics::describe_counter!(
            DATABASE_ROLLBACK,
            metrics::Unit::Count,
            "Store transactions rolled back"
        );
        metrics::describe_counter!(
            REVERT_BLOCK,
            metrics::Unit::Count,
            "Heights reverted while applying reorganizations"
        );

        metrics::counter!(RECEIVE_MESSAGES).increment(0);
        metrics::counter!(PARSE_DATA_ERROR).increment(0);
        metrics::counter!(VALIDATION_ERROR).increment(0);
        metrics::counter!(VALIDATION_SUCCESS).increment(0);
        metrics::counter!(DATABASE_COMMIT).increment(0);
        metrics::counter!(DATABASE_ROLLBACK).increment(0);
        metrics::counter!(REVERT_BLOCK).increment(0);
    }

    /// A message arrived from the bus.
    pub fn record_receive(&self) {
        self.receive_messages.fetch_add(1, Ordering::Relaxed);
        self.latest_receive_message
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        metrics::counter!(RECEIVE_MESSAGES).increment(1);
    }

    /// The decoder rejected a payload.
    pub fn record_parse_error(&self) {
        self.parse_data_error.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(PARSE_DATA_ERROR).increment(1);
    }

    /// A payload failed schema validation.
    pub fn record_validation_error(&self) {
        self.validation_error.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(VALIDATION_ERROR).increment(1);
    }

    /// A payload passed schema validation.
    pub fn record_validation_success(&self) {
        self.validation_success.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(VALIDATION_SUCCESS).increment(1);
    }

    /// A store transaction committed; also refreshes the save timestamp.
    pub fn record_commit(&self) {
        self.database_commit.fetch_add(1, Ordering::Relaxed);
        self.latest_save_data
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        metrics::counter!(DATABASE_COMMIT).increment(1);
    }

    /// A store transaction rolled back.
    pub fn record_rollback(&self) {
        self.database_rollback.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(DATABASE_ROLLBACK).increment(1);
    }

    /// One height was reverted during a reorganization.
    pub fn record_revert_block(&self) {
        self.revert_block.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(REVERT_BLOCK).increment(1);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            receive_messages: self.receive_messages.load(Ordering::Relaxed),
            parse_data_error: self.parse_data_error.load(Ordering::Relaxed),
            validation_error: self.validation_error.load(Ordering::Relaxed),
            validation_success: self.validation_success.load(Ordering::Relaxed),
            database_commit: self.database_commit.load(Ordering::Relaxed),
            database_rollback: self.database_rollback.load(Ordering::Relaxed),
            revert_block: self.revert_block.load(Ordering::Relaxed),
            latest_receive_message: self.latest_receive_message.load(Ordering::Relaxed),
            latest_save_data: self.latest_save_data.load(Ordering::Relaxed),
        }
    }
}
