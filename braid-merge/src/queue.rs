use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Semaphore, mpsc};

/// Item published into the merge queue by a folder worker.
///
/// Sentinels sort strictly before data rows, in declaration order. Rows
/// compare by the caller-supplied [`RowOrder`].
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// The remote index was built against a different design document
    /// revision; the whole query must restart.
    RevisionMismatch,
    /// The backing set view no longer covers the requested partitions.
    SetViewOutdated,
    /// A single index failed; the merge may continue without it.
    Error { source: String, reason: String },
    /// Per-index total row count, announced before the first row.
    RowCount(u64),
    /// Diagnostic passthrough from one index.
    DebugInfo { source: String, blob: Value },
    /// A data row.
    Row(Value),
}

impl QueueItem {
    fn precedence(&self) -> u8 {
        match self {
            QueueItem::RevisionMismatch => 0,
            QueueItem::SetViewOutdated => 1,
            QueueItem::Error { .. } => 2,
            QueueItem::RowCount(_) => 3,
            QueueItem::DebugInfo { .. } => 4,
            QueueItem::Row(_) => 5,
        }
    }
}

/// How data rows compare across producers.
#[derive(Clone)]
pub enum RowOrder {
    /// Rows compare by the index type's collation.
    Ordered(Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>),
    /// The index type defines no row order (e.g. bounding-box queries).
    /// Per-producer FIFO is preserved; across producers the queue always
    /// picks the lowest producer index, which is deterministic but
    /// otherwise meaningless.
    Unordered,
}

impl fmt::Debug for RowOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowOrder::Ordered(_) => f.write_str("RowOrder::Ordered(..)"),
            RowOrder::Unordered => f.write_str("RowOrder::Unordered"),
        }
    }
}

/// Returned to a producer pushing into a queue whose consumer is gone.
#[derive(Debug, Error)]
#[error("merge queue shut down")]
pub struct QueueShutdown;

/// Producer handle held by one folder worker.
///
/// Each producer has a window of exactly one in-flight item: a second
/// `push` waits until the consumer has popped the first. Dropping the
/// handle (or calling [`QueueProducer::done`]) tells the consumer this
/// producer is finished.
#[derive(Debug)]
pub struct QueueProducer {
    id: usize,
    tx: mpsc::UnboundedSender<QueueItem>,
    window: Arc<Semaphore>,
}

impl QueueProducer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn push(&self, item: QueueItem) -> Result<(), QueueShutdown> {
        let permit = self.window.acquire().await.map_err(|_| QueueShutdown)?;
        // The permit comes back through the consumer, once this item has
        // been popped.
        permit.forget();
        self.tx.send(item).map_err(|_| QueueShutdown)
    }

    /// Declare that this producer will push no more items.
    pub fn done(self) {}
}

struct Slot {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    staged: Option<QueueItem>,
    done: bool,
    window: Arc<Semaphore>,
}

/// Bounded k-way merge queue.
///
/// `pop` yields the globally smallest staged item, and only once every
/// producer that is still live has an item staged. This is what makes the
/// merged stream totally ordered: no row is released while a producer that
/// might hold a smaller one is silent.
pub struct MergeQueue {
    slots: Vec<Slot>,
    order: RowOrder,
}

impl fmt::Debug for MergeQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeQueue")
            .field("producers", &self.slots.len())
            .field("order", &self.order)
            .finish()
    }
}

impl MergeQueue {
    pub fn new(producers: usize, order: RowOrder) -> (Self, Vec<QueueProducer>) {
        let mut slots = Vec::with_capacity(producers);
        let mut handles = Vec::with_capacity(producers);
        for id in 0..producers {
            let (tx, rx) = mpsc::unbounded_channel();
            let window = Arc::new(Semaphore::new(1));
            slots.push(Slot {
                rx,
                staged: None,
                done: false,
                window: window.clone(),
            });
            handles.push(QueueProducer { id, tx, window });
        }
        (Self { slots, order }, handles)
    }

    /// Pop the smallest item across all producers.
    ///
    /// Returns `None` once every producer has finished and nothing is left
    /// staged.
    pub async fn pop(&mut self) -> Option<QueueItem> {
        for slot in &mut self.slots {
            if slot.staged.is_none() && !slot.done {
                match slot.rx.recv().await {
                    Some(item) => slot.staged = Some(item),
                    None => slot.done = true,
                }
            }
        }
        self.take_best()
    }

    /// Drain whatever the producers have already sent, without waiting,
    /// so the next `pop` decides on current state.
    pub fn flush(&mut self) {
        for slot in &mut self.slots {
            if slot.staged.is_none() && !slot.done {
                match slot.rx.try_recv() {
                    Ok(item) => slot.staged = Some(item),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => slot.done = true,
                }
            }
        }
    }

    /// Refuse further pushes; any producer blocked in `push` wakes with
    /// [`QueueShutdown`]. Items already sent remain poppable.
    pub fn shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.window.close();
            slot.rx.close();
        }
    }

    fn take_best(&mut self) -> Option<QueueItem> {
        let mut best: Option<(usize, &QueueItem)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(item) = &slot.staged else { continue };
            match &best {
                Some((_, incumbent)) if !Self::before(&self.order, item, incumbent) => {}
                _ => best = Some((idx, item)),
            }
        }
        let idx = best.map(|(idx, _)| idx)?;
        // Delivery re-opens the producer's window.
        self.slots[idx].window.add_permits(1);
        self.slots[idx].staged.take()
    }

    // Strict "a before b"; ties keep the incumbent, so equal items drain in
    // producer-index order.
    fn before(order: &RowOrder, a: &QueueItem, b: &QueueItem) -> bool {
        match a.precedence().cmp(&b.precedence()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => match (a, b) {
                (QueueItem::Row(x), QueueItem::Row(y)) => match order {
                    RowOrder::Ordered(cmp) => cmp(x, y) == Ordering::Less,
                    RowOrder::Unordered => false,
                },
                _ => false,
            },
        }
    }
}

impl Drop for MergeQueue {
    fn drop(&mut self) {
        // A producer blocked in push must not outlive its consumer, even
        // when the queue goes away without an explicit shutdown.
        self.shutdown();
    }
}
