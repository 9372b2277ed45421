use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::collector::{MergeSink, RowPreprocess};
use crate::ddoc::DesignDoc;
use crate::error::Result;
use crate::queue::{QueueItem, QueueProducer, RowOrder};

/// One backing index of a merged query.
#[derive(Debug, Clone)]
pub enum IndexSpec {
    /// An index served by this node.
    Local(LocalSpec),
    /// A merge endpoint on another node, queried over HTTP.
    Remote(RemoteSpec),
}

#[derive(Debug, Clone)]
pub struct LocalSpec {
    pub set_name: String,
    pub ddoc_id: String,
    pub view_name: String,
}

#[derive(Debug, Clone)]
pub struct RemoteSpec {
    /// Base URL of the remote merge endpoint.
    pub url: Url,
    /// Body forwarded to the remote, minus the revision field which the
    /// coordinator injects per attempt.
    pub body: RemoteMergeBody,
    /// Opaque TLS options handed to the HTTP layer.
    pub ssl_params: Option<Value>,
}

/// JSON body POSTed to a remote merge endpoint.
///
/// Only `ddoc_revision` is meaningful here; everything else is the remote's
/// own merge specification and rides along untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMergeBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddoc_revision: Option<String>,
    #[serde(flatten)]
    pub spec: Map<String, Value>,
}

/// Revision discipline for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionPolicy {
    /// No revision checking; nothing is injected into remote bodies.
    None,
    /// Accept whatever revision the store currently has, retrying the
    /// query when a remote disagrees.
    Auto,
    /// The query is only valid against this exact revision.
    Exact(String),
}

/// HTTP-level view parameters, carried opaquely and rendered into the
/// remote query string by the index module.
#[derive(Debug, Clone, Default)]
pub struct HttpQueryParams(pub Vec<(String, String)>);

/// Immutable configuration for one merged query.
#[derive(Debug)]
pub struct MergeRequest {
    pub specs: Vec<IndexSpec>,
    pub revision: RevisionPolicy,
    pub params: HttpQueryParams,
    pub skip: u64,
    pub limit: u64,
    /// Overrides the coordinator's connection timeout when set.
    pub connection_timeout: Option<Duration>,
    /// Hard deadline for the whole query; on expiry the caller gets a
    /// timeout error and every worker is torn down.
    pub watchdog: Option<Duration>,
}

impl MergeRequest {
    pub fn new(specs: Vec<IndexSpec>) -> Self {
        Self {
            specs,
            revision: RevisionPolicy::None,
            params: HttpQueryParams::default(),
            skip: 0,
            limit: u64::MAX,
            connection_timeout: None,
            watchdog: None,
        }
    }

    pub(crate) fn first_local(&self) -> Option<&LocalSpec> {
        self.specs.iter().find_map(|spec| match spec {
            IndexSpec::Local(local) => Some(local),
            IndexSpec::Remote(_) => None,
        })
    }
}

/// Per-query capabilities built by the index module once the design
/// document is resolved.
pub struct MergeFuns {
    /// Row collation for the merge queue.
    pub order: RowOrder,
    /// Applied to each row before it reaches the sink.
    pub preprocess: Option<RowPreprocess>,
    /// Module-private context threaded through to `fold_local`.
    pub extra: Option<Value>,
}

impl std::fmt::Debug for MergeFuns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeFuns")
            .field("order", &self.order)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

/// Capability record of one index type (map views, reduce views, spatial).
///
/// The merger never looks inside rows or design documents; everything
/// index-shaped goes through this trait.
#[async_trait]
pub trait IndexModule: Send + Sync {
    /// Index type name, used for stats and logging.
    fn name(&self) -> &str;

    /// Validate raw query parameters from the HTTP surface into the
    /// opaque parameter set carried by the request.
    fn parse_http_params(
        &self,
        raw: &[(String, String)],
        ddoc: &DesignDoc,
        view_name: &str,
    ) -> Result<HttpQueryParams>;

    /// Render the query string appended to a remote merge URL.
    fn view_query_string(&self, params: &HttpQueryParams) -> String;

    /// Give the module a chance to fold its extra context into an
    /// outgoing remote body.
    fn process_extra_params(&self, extra: Option<&Value>, body: &mut RemoteMergeBody)
    -> Result<()>;

    /// Build the per-query capabilities from the resolved design document.
    fn make_funs(
        &self,
        ddoc: &DesignDoc,
        view_name: &str,
        params: &HttpQueryParams,
    ) -> Result<MergeFuns>;

    /// Extract skip/limit from parsed parameters (used by the HTTP
    /// surface to fill the request).
    fn skip_and_limit(&self, params: &HttpQueryParams) -> (u64, u64);

    /// Translate one streamed remote row into a queue item. Ordered index
    /// types wrap it in [`QueueItem::Row`]; unstructured streams may remap
    /// it.
    fn map_remote_row(&self, row: Value) -> QueueItem;

    /// Fold the local index, pushing every record into the queue. A
    /// known index size is announced as a row count before the first row.
    async fn fold_local(
        &self,
        spec: &LocalSpec,
        funs: &MergeFuns,
        producer: &QueueProducer,
    ) -> Result<()>;

    /// Fast path for a query with exactly one local index: no queue, no
    /// workers, events straight into the sink.
    async fn simple_query(
        &self,
        spec: &LocalSpec,
        ddoc: &DesignDoc,
        params: &HttpQueryParams,
        sink: &mut dyn MergeSink,
    ) -> Result<()>;
}
