use crate::error::{BridgeError, Result};
use crate::types::SampleRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Creates a bounded FIFO queue of sample records with the given capacity.
///
/// Many producers may push concurrently through the [`QueueWriter`]; exactly one consumer
/// drains it through the [`QueueReader`]. Pushing blocks while the queue is full.
pub fn sample_queue(capacity: usize) -> (QueueWriter, QueueReader) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let pending = Arc::new(AtomicU64::new(0));
    (
        QueueWriter {
            tx: RwLock::new(Some(tx)),
            pending: Arc::clone(&pending),
        },
        QueueReader { rx, pending },
    )
}

/// Producer side. Closing drops the shared sender; senders cloned by in-flight pushes finish
/// their push and are then dropped, after which the reader observes disconnection.
#[derive(Debug)]
pub struct QueueWriter {
    tx: RwLock<Option<SyncSender<SampleRecord>>>,
    pending: Arc<AtomicU64>,
}

impl QueueWriter {
    /// Pushes a record, blocking while the queue is at capacity.
    pub fn push(&self, record: SampleRecord) -> Result<()> {
        // Clone the sender and release the lock before a potentially blocking send, so that
        // concurrent producers and `close` never wait on a blocked producer's guard.
        let tx = match self.tx.read()?.as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(BridgeError::WriterClosed),
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(record).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            BridgeError::WriterClosed
        })
    }

    /// Closes the queue for new pushes. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.tx.write()?.take();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Records pushed (or being pushed) but not yet taken by the reader.
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

/// Consumer side, owned by the flush thread.
#[derive(Debug)]
pub struct QueueReader {
    rx: Receiver<SampleRecord>,
    pending: Arc<AtomicU64>,
}

/// One drawn batch and whether the queue is still open afterwards.
#[derive(Debug, Default)]
pub struct Drained {
    pub records: Vec<SampleRecord>,
    pub open: bool,
}

impl QueueReader {
    /// Draws up to `max` records, blocking for each one.
    ///
    /// Stops early when the queue is closed and empty. With `linger` set, also stops once
    /// that much time has passed since the first record of the batch arrived.
    pub fn drain_batch(&self, max: usize, linger: Option<Duration>) -> Drained {
        let mut records = Vec::with_capacity(max.min(1024));
        let mut deadline: Option<Instant> = None;

        while records.len() < max {
            let next = match deadline {
                None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        break;
                    }
                    self.rx.recv_timeout(at - now)
                }
            };
            match next {
                Ok(record) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    records.push(record);
                    if deadline.is_none() {
                        deadline = linger.map(|d| Instant::now() + d);
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Drained {
                        records,
                        open: false,
                    };
                }
            }
        }

        Drained {
            records,
            open: true,
        }
    }
}
