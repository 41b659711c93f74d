//! Message bus consumer contract.
//!
//! The bus itself is an external collaborator: it delivers opaque payloads
//! in partition order and exposes an offset commit. The controller only
//! depends on the [`BusConsumer`] trait; transports (a Kafka client, a
//! kafkacat pipe, an in-process channel) implement it.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// A message delivered from the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,

    /// Partition the message was read from.
    pub partition: i32,

    /// Offset of the message within its partition.
    pub offset: i64,

    /// Opaque payload bytes (a JSON block document in this pipeline).
    pub payload: Vec<u8>,
}

/// Blocking source of bus messages with at-least-once redelivery.
///
/// `commit` acknowledges a message; anything not committed is expected to be
/// redelivered by the transport after a restart.
#[async_trait]
pub trait BusConsumer: Send {
    /// Wait for the next message. `None` means the transport has closed and
    /// the ingestion loop should exit.
    async fn next(&mut self) -> Option<BusMessage>;

    /// Acknowledge a message as fully persisted.
    async fn commit(&mut self, message: &BusMessage) -> Result<()>;
}

/// Channel-backed consumer.
///
/// Used as the in-process transport: a feeder task pushes messages into the
/// sending half while the controller drains the receiving half. Committed
/// offsets are recorded so surrounding tooling (and tests) can observe
/// acknowledgement progress.
pub struct ChannelConsumer {
    receiver: mpsc::Receiver<BusMessage>,
    committed: Arc<Mutex<Vec<i64>>>,
}

impl ChannelConsumer {
    /// Create a sender/consumer pair with the given channel capacity.
    pub fn pair(capacity: usize) -> (mpsc::Sender<BusMessage>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            sender,
            Self {
                receiver,
                committed: Arc::new(Mutex::new(Vec::new())),
            },
        )
    }

    /// Handle on the committed-offset log.
    pub fn committed_offsets(&self) -> Arc<Mutex<Vec<i64>>> {
        Arc::clone(&self.committed)
    }
}

#[async_trait]
impl BusConsumer for ChannelConsumer {
    async fn next(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<()> {
        self.committed
            .lock()
            .expect("committed offset log poisoned")
            .push(message.offset);
        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "offset committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_records_commits() {
        let (sender, mut consumer) = ChannelConsumer::pair(8);
        for offset in 0..3 {
            sender
                .send(BusMessage {
                    topic: "btc_block".into(),
                    partition: 0,
                    offset,
                    payload: b"{}".to_vec(),
                })
                .await
                .unwrap();
        }
        drop(sender);

        let first = consumer.next().await.unwrap();
        assert_eq!(first.offset, 0);
        consumer.commit(&first).await.unwrap();

        let second = consumer.next().await.unwrap();
        assert_eq!(second.offset, 1);

        let third = consumer.next().await.unwrap();
        consumer.commit(&third).await.unwrap();

        assert!(consumer.next().await.is_none());
        assert_eq!(*consumer.committed_offsets().lock().unwrap(), vec![0, 2]);
    }
}
