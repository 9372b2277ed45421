use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::collector::{Fold, MergeSink, RowCollector};
use crate::ddoc::DesignDocStore;
use crate::error::{MergeError, Result};
use crate::index::{IndexModule, IndexSpec, MergeFuns, MergeRequest, RevisionPolicy};
use crate::queue::{MergeQueue, QueueItem};
use crate::stats::QueryStatsObserver;
use crate::worker::{FolderWorker, RemoteContext, spawn_local, spawn_remote};

/// Coordinator-wide tunables.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Applied to HTTP connection establishment and to every body chunk
    /// read, unless the request overrides it.
    pub connection_timeout: Duration,
    /// Attempts before a drifting design-document revision becomes an
    /// error.
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Response body chunks allowed in flight per remote index.
    pub chunk_window: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(60),
            max_retries: 30,
            retry_interval: Duration::from_secs(1),
            chunk_window: 3,
        }
    }
}

/// Owns the lifecycle of merged queries: design-document resolution,
/// worker fan-out, ordered drain, retry on revision drift, and teardown.
pub struct MergeCoordinator {
    store: Arc<dyn DesignDocStore>,
    stats: Arc<dyn QueryStatsObserver>,
    config: MergeConfig,
    client: reqwest::Client,
}

impl MergeCoordinator {
    pub fn new(
        store: Arc<dyn DesignDocStore>,
        stats: Arc<dyn QueryStatsObserver>,
        config: MergeConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout)
            .build()?;
        Ok(Self::with_client(store, stats, config, client))
    }

    /// Use a caller-built HTTP client (custom TLS, proxies). Remote specs
    /// carry their TLS options opaquely; hosts that need them build the
    /// client here.
    pub fn with_client(
        store: Arc<dyn DesignDocStore>,
        stats: Arc<dyn QueryStatsObserver>,
        config: MergeConfig,
        client: reqwest::Client,
    ) -> Self {
        Self {
            store,
            stats,
            config,
            client,
        }
    }

    /// Run one merged query, delivering events into `sink`.
    pub async fn query(
        &self,
        module: Arc<dyn IndexModule>,
        request: MergeRequest,
        sink: &mut dyn MergeSink,
    ) -> Result<()> {
        let started = Instant::now();
        let ddoc_label = request
            .first_local()
            .map(|local| local.ddoc_id.clone())
            .unwrap_or_default();

        let result = match request.watchdog {
            Some(deadline) => timeout(deadline, self.run_with_retries(&module, &request, sink))
                .await
                .unwrap_or(Err(MergeError::Timeout(deadline))),
            None => self.run_with_retries(&module, &request, sink).await,
        };

        self.stats
            .record(&ddoc_label, module.name(), started.elapsed());
        if let Err(err) = &result {
            warn!(ddoc = %ddoc_label, index = module.name(), error = %err, "merged query failed");
        }
        result
    }

    async fn run_with_retries(
        &self,
        module: &Arc<dyn IndexModule>,
        request: &MergeRequest,
        sink: &mut dyn MergeSink,
    ) -> Result<()> {
        for attempt in 1..=self.config.max_retries {
            match self.run_attempt(module, request, sink).await {
                Err(MergeError::RevisionMismatch)
                    if request.revision == RevisionPolicy::Auto =>
                {
                    info!(attempt, "design document revision drifted, retrying");
                    sleep(self.config.retry_interval).await;
                }
                other => return other,
            }
        }
        Err(MergeError::RevisionSyncFailed {
            attempts: self.config.max_retries,
        })
    }

    async fn run_attempt(
        &self,
        module: &Arc<dyn IndexModule>,
        request: &MergeRequest,
        sink: &mut dyn MergeSink,
    ) -> Result<()> {
        let local = request.first_local().ok_or_else(|| {
            MergeError::InvalidRequest("a merge needs at least one local index".into())
        })?;
        let ddoc = self.store.get_ddoc(&local.set_name, &local.ddoc_id).await?;

        if let RevisionPolicy::Exact(revision) = &request.revision {
            if *revision != ddoc.revision {
                return Err(MergeError::RevisionMismatch);
            }
        }
        let inject_revision = match &request.revision {
            RevisionPolicy::None => None,
            RevisionPolicy::Auto => Some(ddoc.revision.clone()),
            RevisionPolicy::Exact(revision) => Some(revision.clone()),
        };

        let view_name = local.view_name.clone();
        let funs = Arc::new(module.make_funs(&ddoc, &view_name, &request.params)?);

        if request.specs.len() == 1 {
            if let IndexSpec::Local(local) = &request.specs[0] {
                debug!(set = %local.set_name, view = %view_name, "single local index, fast path");
                return module.simple_query(local, &ddoc, &request.params, sink).await;
            }
        }

        // Validate and prepare everything fallible before any task exists,
        // so an early error has nothing to tear down.
        let connection_timeout = request
            .connection_timeout
            .unwrap_or(self.config.connection_timeout);
        let query_string = module.view_query_string(&request.params);
        let mut prepared = Vec::with_capacity(request.specs.len());
        for spec in &request.specs {
            match spec {
                IndexSpec::Local(local) => prepared.push(Prepared::Local(local.clone())),
                IndexSpec::Remote(remote) => {
                    let mut remote = remote.clone();
                    remote.body.ddoc_revision = inject_revision.clone();
                    module.process_extra_params(funs.extra.as_ref(), &mut remote.body)?;
                    prepared.push(Prepared::Remote(RemoteContext {
                        client: self.client.clone(),
                        module: module.clone(),
                        source: remote.url.to_string(),
                        spec: remote,
                        query_string: query_string.clone(),
                        timeout: connection_timeout,
                        window: self.config.chunk_window,
                    }));
                }
            }
        }

        let (mut queue, producers) = MergeQueue::new(prepared.len(), funs.order.clone());
        let mut workers = WorkerSet::default();
        for (spec, producer) in prepared.into_iter().zip(producers) {
            workers.0.push(match spec {
                Prepared::Local(local) => {
                    spawn_local(module.clone(), local, funs.clone(), producer)
                }
                Prepared::Remote(ctx) => spawn_remote(ctx, producer),
            });
        }
        debug!(indexes = workers.0.len(), "merging");

        let outcome = merge_loop(&mut queue, request, &funs, sink).await;

        // Shut the queue first so a worker blocked in push wakes up, then
        // wait for every worker on every control path.
        queue.shutdown();
        workers.stop_all().await;
        outcome
    }
}

/// Folder workers of one attempt. If the attempt future is dropped (the
/// watchdog fired), the remaining tasks are aborted rather than leaked.
#[derive(Default)]
struct WorkerSet(Vec<FolderWorker>);

impl WorkerSet {
    async fn stop_all(&mut self) {
        for worker in self.0.drain(..) {
            worker.stop().await;
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        for worker in &self.0 {
            worker.abort();
        }
    }
}

impl std::fmt::Debug for MergeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Prepared {
    Local(crate::index::LocalSpec),
    Remote(RemoteContext),
}

async fn merge_loop(
    queue: &mut MergeQueue,
    request: &MergeRequest,
    funs: &MergeFuns,
    sink: &mut dyn MergeSink,
) -> Result<()> {
    let producers = request.specs.len();
    let mut collector = RowCollector::new(
        producers,
        request.skip,
        request.limit,
        funs.preprocess.clone(),
        sink,
    );
    loop {
        queue.flush();
        match queue.pop().await {
            None => {
                collector.close();
                return Ok(());
            }
            Some(QueueItem::RevisionMismatch) => return Err(MergeError::RevisionMismatch),
            Some(QueueItem::SetViewOutdated) => return Err(MergeError::SetViewOutdated),
            Some(item) => {
                if collector.on_item(item) == Fold::Halt {
                    return Ok(());
                }
            }
        }
    }
}
