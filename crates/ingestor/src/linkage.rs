//! Chain linkage check for incoming blocks.
//!
//! Decides, against the committed store, whether a block continues the
//! chain, reveals a gap, or disagrees with the stored parent. Gap and
//! disagreement both trigger a bounded re-emit request to the upstream
//! node; the checker itself never writes to the store.

use chainsink_core::Block;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::rpc::NodeApi;
use crate::storage::{blocks, Storage};

/// Outcome of a linkage check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// The block links onto the stored parent; persist it.
    Continue,

    /// The parent is missing; the range `[from..to]` was requested from the
    /// upstream node.
    Gap {
        /// First height of the requested window.
        from: i64,
        /// Last height of the requested window.
        to: i64,
    },

    /// A parent is stored at `height - 1` but its hash disagrees; the range
    /// `[from..from + 1]` was requested so the fork point is redelivered.
    ReorgOnParent {
        /// Height of the disagreeing stored parent.
        from: i64,
    },

    /// The store could not be queried. No request was emitted; the check
    /// repeats when the message is redelivered.
    Error,
}

/// Read-only linkage checker bound to the store and the upstream node.
pub struct LinkageChecker {
    storage: Storage,
    node: Arc<dyn NodeApi>,
    max_batch_block: i64,
}

impl LinkageChecker {
    /// Create a checker. `max_batch_block` bounds each re-emit window.
    pub fn new(storage: Storage, node: Arc<dyn NodeApi>, max_batch_block: i64) -> Self {
        Self {
            storage,
            node,
            max_batch_block,
        }
    }

    /// Check an incoming block against the committed store.
    pub async fn check(&self, block: &Block) -> Linkage {
        let parent = match blocks::block_at_height(self.storage.pool(), block.height - 1).await {
            Ok(parent) => parent,
            Err(e) => {
                error!(height = block.height, "linkage check failed: {:#}", e);
                return Linkage::Error;
            }
        };

        let Some(parent) = parent else {
            warn!(
                height = block.height,
                "previous block {} not stored", block.height - 1
            );
            return self.request_gap_fill(block).await;
        };

        if parent.hash != block.previous_hash {
            warn!(
                height = parent.height,
                stored = %parent.hash,
                declared = %block.previous_hash,
                "stored parent disagrees with incoming block"
            );
            if let Err(e) = self
                .node
                .send_batch_block(parent.height, block.height)
                .await
            {
                error!("re-emit request failed: {:#}", e);
            }
            return Linkage::ReorgOnParent {
                from: parent.height,
            };
        }

        debug!(height = block.height, "linkage check passed");
        Linkage::Continue
    }

    /// Ask the upstream to re-emit the window between the stored tip and the
    /// incoming block. On an empty store the window starts at genesis.
    async fn request_gap_fill(&self, block: &Block) -> Linkage {
        let tip = match blocks::tip_block(self.storage.pool()).await {
            Ok(tip) => tip,
            Err(e) => {
                error!(height = block.height, "tip lookup failed: {:#}", e);
                return Linkage::Error;
            }
        };

        let start = tip.map(|t| t.height).unwrap_or(-1);
        let mut end = block.height;
        if block.height > start + self.max_batch_block {
            end = start + self.max_batch_block;
        }

        debug!(from = start + 1, to = end, "requesting gap fill");
        if let Err(e) = self.node.send_batch_block(start + 1, end).await {
            error!("re-emit request failed: {:#}", e);
        }

        Linkage::Gap {
            from: start + 1,
            to: end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::blocks::insert_block;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct RecordingNode {
        calls: Mutex<Vec<(i64, i64)>>,
    }

    impl RecordingNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(i64, i64)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeApi for RecordingNode {
        async fn send_batch_block(&self, start: i64, end: i64) -> Result<()> {
            self.calls.lock().unwrap().push((start, end));
            Ok(())
        }
    }

    fn block(height: i64, hash: &str, previous_hash: &str) -> Block {
        Block {
            height,
            hash: hash.into(),
            previous_hash: previous_hash.into(),
            timestamp: 1000 + height,
            version: 1,
            miner: String::new(),
        }
    }

    async fn setup() -> (Storage, NamedTempFile) {
        let temp_db = NamedTempFile::new().unwrap();
        let storage = Storage::connect_with_path(temp_db.path()).await.unwrap();
        storage.run_migrations().await.unwrap();
        (storage, temp_db)
    }

    async fn store_block(storage: &Storage, b: &Block) {
        let mut tx = storage.begin().await.unwrap();
        insert_block(&mut tx, b).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn continues_when_parent_hash_matches() {
        let (storage, _temp_db) = setup().await;
        store_block(&storage, &block(99, "h99", "h98")).await;

        let node = RecordingNode::new();
        let checker = LinkageChecker::new(storage, node.clone(), 100);

        let outcome = checker.check(&block(100, "h100", "h99")).await;
        assert_eq!(outcome, Linkage::Continue);
        assert!(node.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_store_requests_from_genesis() {
        let (storage, _temp_db) = setup().await;
        let node = RecordingNode::new();
        let checker = LinkageChecker::new(storage, node.clone(), 200);

        let outcome = checker.check(&block(105, "h105", "h104")).await;
        assert_eq!(outcome, Linkage::Gap { from: 0, to: 105 });
        assert_eq!(node.calls(), vec![(0, 105)]);
    }

    #[tokio::test]
    async fn gap_window_is_bounded_by_max_batch_block() {
        let (storage, _temp_db) = setup().await;
        store_block(&storage, &block(10, "h10", "h9")).await;

        let node = RecordingNode::new();
        let checker = LinkageChecker::new(storage, node.clone(), 20);

        let outcome = checker.check(&block(500, "h500", "h499")).await;
        assert_eq!(outcome, Linkage::Gap { from: 11, to: 30 });
        assert_eq!(node.calls(), vec![(11, 30)]);
    }

    #[tokio::test]
    async fn short_gap_requests_up_to_incoming_block() {
        let (storage, _temp_db) = setup().await;
        store_block(&storage, &block(10, "h10", "h9")).await;

        let node = RecordingNode::new();
        let checker = LinkageChecker::new(storage, node.clone(), 100);

        let outcome = checker.check(&block(13, "h13", "h12")).await;
        assert_eq!(outcome, Linkage::Gap { from: 11, to: 13 });
        assert_eq!(node.calls(), vec![(11, 13)]);
    }

    #[tokio::test]
    async fn parent_hash_mismatch_requests_fork_window() {
        let (storage, _temp_db) = setup().await;
        store_block(&storage, &block(50, "X", "h49")).await;

        let node = RecordingNode::new();
        let checker = LinkageChecker::new(storage, node.clone(), 100);

        let outcome = checker.check(&block(51, "h51", "Y")).await;
        assert_eq!(outcome, Linkage::ReorgOnParent { from: 50 });
        assert_eq!(node.calls(), vec![(50, 51)]);
    }
}
