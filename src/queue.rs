//! Bounded write queue decoupling network reads from storage.
//!
//! The queue is the only shared mutable state between the network-reading
//! task and the persistence worker. Enqueueing never blocks: a full queue
//! drops the record with a warning, because a stalled reader risks the
//! remote server dropping the session. Lock contention on the storage side
//! is the worker's problem, never the reader's.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::record::{SpotRecord, WwvRecord};
use crate::stats::IngestStats;

/// One pending storage write.
///
/// The variant selects the insert statement; the persistence worker groups
/// queued writes by variant to issue batched multi-row inserts.
#[derive(Debug, Clone)]
pub enum QueuedWrite {
    /// Insert into the spot table.
    Spot(SpotRecord),
    /// Insert into the WWV table.
    Wwv(WwvRecord),
}

impl QueuedWrite {
    /// Short label for log messages.
    pub fn describe(&self) -> &'static str {
        match self {
            QueuedWrite::Spot(_) => "spot",
            QueuedWrite::Wwv(_) => "WWV",
        }
    }
}

/// Producer handle for the bounded write queue.
///
/// Cloneable: multiple simultaneous cluster connections can share one queue.
/// Exactly one consumer (the persistence worker) drains it.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<QueuedWrite>,
    stats: Arc<IngestStats>,
}

/// Create a bounded queue, returning the producer handle and the consumer
/// receiver for the persistence worker.
pub fn write_queue(
    capacity: usize,
    stats: Arc<IngestStats>,
) -> (WriteQueue, mpsc::Receiver<QueuedWrite>) {
    let (tx, rx) = mpsc::channel(capacity);
    (WriteQueue { tx, stats }, rx)
}

impl WriteQueue {
    /// Enqueue a write, returning immediately.
    ///
    /// A full queue drops the record and logs a warning; back-pressure must
    /// never stall protocol I/O.
    pub fn enqueue(&self, write: QueuedWrite) {
        match self.tx.try_send(write) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(write)) => {
                self.stats.record_queue_drop();
                warn!("write queue full, dropping {} record", write.describe());
            }
            Err(mpsc::error::TrySendError::Closed(write)) => {
                warn!(
                    "write queue closed, dropping {} record",
                    write.describe()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Mode;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn make_spot() -> SpotRecord {
        SpotRecord {
            de: "W1AW".to_string(),
            frequency_khz: 14025.0,
            dx: "K1ABC".to_string(),
            message: "CW 10 dB".to_string(),
            cont_de: "NA".to_string(),
            cont_dx: "NA".to_string(),
            cq_de: 5,
            itu_de: 8,
            cq_dx: 5,
            itu_dx: 8,
            mode: Mode::Cw,
            signal_db: Some(10),
            band: 20,
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_receive() {
        let stats = Arc::new(IngestStats::new());
        let (queue, mut rx) = write_queue(4, stats);

        queue.enqueue(QueuedWrite::Spot(make_spot()));
        let received = rx.recv().await.expect("record should arrive");
        assert!(matches!(received, QueuedWrite::Spot(_)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let stats = Arc::new(IngestStats::new());
        let (queue, _rx) = write_queue(2, Arc::clone(&stats));

        queue.enqueue(QueuedWrite::Spot(make_spot()));
        queue.enqueue(QueuedWrite::Spot(make_spot()));

        // Queue is full; the next three must return immediately and drop.
        let start = Instant::now();
        for _ in 0..3 {
            queue.enqueue(QueuedWrite::Spot(make_spot()));
        }
        assert!(start.elapsed().as_millis() < 100, "enqueue must not block");
        assert_eq!(stats.queue_drops.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_closed_queue_does_not_panic() {
        let stats = Arc::new(IngestStats::new());
        let (queue, rx) = write_queue(2, Arc::clone(&stats));
        drop(rx);

        queue.enqueue(QueuedWrite::Spot(make_spot()));
        // Closed-channel drops are not queue overflows.
        assert_eq!(stats.queue_drops.load(Ordering::Relaxed), 0);
    }
}
