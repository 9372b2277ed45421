//! Scatter/gather merger for index queries.
//!
//! One query fans out to N backing indexes, local or remote over HTTP.
//! Each index gets a folder worker pushing rows into a bounded merge
//! queue; the coordinator drains the queue in comparator order through a
//! collector that enforces skip/limit and feeds the caller's sink. Remote
//! failures surface as per-index error events; a drifting design-document
//! revision restarts the query transparently.

pub mod collector;
pub mod coordinator;
pub mod ddoc;
pub mod error;
pub mod index;
pub mod queue;
pub mod stats;

mod streamer;
mod worker;

pub use collector::{MergeEvent, MergeSink, RowPreprocess, Step};
pub use coordinator::{MergeConfig, MergeCoordinator};
pub use ddoc::{DesignDoc, DesignDocStore};
pub use error::{MergeError, Result};
pub use index::{
    HttpQueryParams, IndexModule, IndexSpec, LocalSpec, MergeFuns, MergeRequest, RemoteMergeBody,
    RemoteSpec, RevisionPolicy,
};
pub use queue::{MergeQueue, QueueItem, QueueProducer, QueueShutdown, RowOrder};
pub use stats::{NoopStats, QueryStatsObserver};
