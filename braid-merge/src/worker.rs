use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::MergeError;
use crate::index::{IndexModule, LocalSpec, MergeFuns, RemoteSpec};
use crate::queue::{QueueItem, QueueProducer};
use crate::streamer::{RowStreamer, StreamedItem};

/// One spawned folder task feeding the merge queue.
pub(crate) struct FolderWorker {
    source: String,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl FolderWorker {
    /// Kill the task outright. Only the watchdog path uses this; the
    /// normal teardown goes through [`FolderWorker::stop`].
    pub(crate) fn abort(&self) {
        self.handle.abort();
    }

    /// Signal shutdown and wait for the task to finish. The merge queue
    /// must already be shut down so a worker blocked in `push` is awake.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.try_send(());
        match self.handle.await {
            Ok(()) => trace!(source = %self.source, "folder worker stopped"),
            Err(err) if err.is_panic() => {
                error!(source = %self.source, "folder worker panicked")
            }
            Err(_) => {}
        }
    }
}

/// Spawn a worker folding a local index.
pub(crate) fn spawn_local(
    module: Arc<dyn IndexModule>,
    spec: LocalSpec,
    funs: Arc<MergeFuns>,
    producer: QueueProducer,
) -> FolderWorker {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let source = spec.set_name.clone();
    let worker_source = source.clone();
    let handle = tokio::spawn(async move {
        let result = tokio::select! {
            _ = shutdown_rx.recv() => Ok(()),
            result = module.fold_local(&spec, &funs, &producer) => result,
        };
        report_failure(&producer, &worker_source, result).await;
        // Dropping the producer tells the queue this index is done.
    });
    FolderWorker {
        source,
        shutdown_tx,
        handle,
    }
}

/// Everything a remote folder task needs, made explicit up front.
pub(crate) struct RemoteContext {
    pub client: reqwest::Client,
    pub module: Arc<dyn IndexModule>,
    pub spec: RemoteSpec,
    pub query_string: String,
    pub timeout: Duration,
    pub window: usize,
    pub source: String,
}

/// Spawn a worker streaming rows from a remote merge endpoint.
pub(crate) fn spawn_remote(ctx: RemoteContext, producer: QueueProducer) -> FolderWorker {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    let source = ctx.source.clone();
    let worker_source = source.clone();
    let handle = tokio::spawn(async move {
        let mut pump: Option<JoinHandle<()>> = None;
        let result = tokio::select! {
            _ = shutdown_rx.recv() => Ok(()),
            result = run_remote(&ctx, &producer, &mut pump) => result,
        };
        report_failure(&producer, &worker_source, result).await;
        // The pump keeps emptying the response body even after we stop
        // consuming, so the pooled connection comes back clean.
        if let Some(mut pump) = pump {
            if timeout(ctx.timeout, &mut pump).await.is_err() {
                warn!(source = %worker_source, "response drain timed out, dropping connection");
                pump.abort();
            }
        }
    });
    FolderWorker {
        source,
        shutdown_tx,
        handle,
    }
}

async fn report_failure(
    producer: &QueueProducer,
    source: &str,
    result: Result<(), MergeError>,
) {
    let item = match result {
        Ok(()) | Err(MergeError::QueueShutdown) => return,
        Err(MergeError::Index { index, reason }) => QueueItem::Error {
            source: index,
            reason,
        },
        Err(err) => QueueItem::Error {
            source: source.to_owned(),
            reason: err.to_string(),
        },
    };
    warn!(source, "folder worker failed");
    let _ = producer.push(item).await;
}

async fn run_remote(
    ctx: &RemoteContext,
    producer: &QueueProducer,
    pump_slot: &mut Option<JoinHandle<()>>,
) -> Result<(), MergeError> {
    let mut url = ctx.spec.url.clone();
    if !ctx.query_string.is_empty() {
        url.set_query(Some(&ctx.query_string));
    }
    debug!(url = %url, "querying remote index");

    let response = timeout(
        ctx.timeout,
        ctx.client.post(url).json(&ctx.spec.body).send(),
    )
    .await
    .map_err(|_| MergeError::Timeout(ctx.timeout))??;

    let status = response.status();
    if status.as_u16() != 200 {
        let body = timeout(ctx.timeout, response.bytes())
            .await
            .map_err(|_| MergeError::Timeout(ctx.timeout))??;
        let item = translate_error_body(&ctx.source, &body);
        debug!(source = %ctx.source, status = status.as_u16(), "remote index refused the query");
        producer
            .push(item)
            .await
            .map_err(|_| MergeError::QueueShutdown)?;
        return Ok(());
    }

    let (chunk_tx, mut chunk_rx) = mpsc::channel(ctx.window.max(1));
    *pump_slot = Some(tokio::spawn(pump_body(
        response.bytes_stream(),
        chunk_tx,
        ctx.timeout,
    )));

    let mut streamer = RowStreamer::new();
    let mut items = Vec::new();
    while let Some(chunk) = chunk_rx.recv().await {
        let bytes = chunk.map_err(|reason| MergeError::Index {
            index: ctx.source.clone(),
            reason,
        })?;
        streamer.feed(&bytes, &mut items)?;
        for item in items.drain(..) {
            producer
                .push(translate_streamed(ctx, item))
                .await
                .map_err(|_| MergeError::QueueShutdown)?;
        }
    }
    streamer.finish()?;
    Ok(())
}

/// Forward body chunks into a bounded channel; once the consumer stops
/// listening, keep reading to exhaustion so the connection can be reused.
async fn pump_body<S>(stream: S, tx: mpsc::Sender<Result<Bytes, String>>, chunk_timeout: Duration)
where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    tokio::pin!(stream);
    loop {
        match timeout(chunk_timeout, stream.next()).await {
            Err(_) => {
                let _ = tx.try_send(Err("timed out reading response body".to_owned()));
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                let _ = tx.send(Err(err.to_string())).await;
                return;
            }
            Ok(Some(Ok(bytes))) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    break;
                }
            }
        }
    }
    trace!("draining abandoned response body");
    while let Ok(Some(next)) = timeout(chunk_timeout, stream.next()).await {
        if next.is_err() {
            break;
        }
    }
}

fn translate_streamed(ctx: &RemoteContext, item: StreamedItem) -> QueueItem {
    match item {
        StreamedItem::TotalRows(count) => QueueItem::RowCount(count),
        StreamedItem::Row(row) => ctx.module.map_remote_row(row),
        StreamedItem::ErrorEntry(entry) => {
            let source = entry
                .get("from")
                .and_then(Value::as_str)
                .unwrap_or(&ctx.source)
                .to_owned();
            let reason = match entry.get("reason") {
                Some(Value::String(reason)) => reason.clone(),
                Some(other) => other.to_string(),
                None => entry.to_string(),
            };
            QueueItem::Error { source, reason }
        }
        StreamedItem::DebugInfo(blob) => QueueItem::DebugInfo {
            source: ctx.source.clone(),
            blob,
        },
    }
}

/// Map a non-200 response body onto a queue item.
fn translate_error_body(source: &str, body: &[u8]) -> QueueItem {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => {
            return QueueItem::Error {
                source: source.to_owned(),
                reason: String::from_utf8_lossy(body).into_owned(),
            };
        }
    };
    let error = parsed.get("error").and_then(Value::as_str);
    let reason = parsed.get("reason").and_then(Value::as_str);
    match (error, reason) {
        (Some("not_found"), Some(reason)) if reason != "missing" && reason != "deleted" => {
            QueueItem::Error {
                source: source.to_owned(),
                reason: reason.to_owned(),
            }
        }
        (Some("not_found"), _) => QueueItem::Error {
            source: source.to_owned(),
            reason: "not_found".to_owned(),
        },
        (Some("error"), Some("revision_mismatch")) => QueueItem::RevisionMismatch,
        (Some("error"), Some("set_view_outdated")) => QueueItem::SetViewOutdated,
        (Some(_), Some(reason)) => QueueItem::Error {
            source: source.to_owned(),
            reason: reason.to_owned(),
        },
        _ => QueueItem::Error {
            source: source.to_owned(),
            reason: parsed.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_not_found_keeps_specific_reason() {
        let item = translate_error_body("http://b", br#"{"error":"not_found","reason":"no_db_file"}"#);
        assert!(
            matches!(item, QueueItem::Error { reason, .. } if reason == "no_db_file")
        );
    }

    #[test]
    fn error_body_not_found_missing_collapses() {
        let item = translate_error_body("http://b", br#"{"error":"not_found","reason":"missing"}"#);
        assert!(matches!(item, QueueItem::Error { reason, .. } if reason == "not_found"));
        let item = translate_error_body("http://b", br#"{"error":"not_found","reason":"deleted"}"#);
        assert!(matches!(item, QueueItem::Error { reason, .. } if reason == "not_found"));
    }

    #[test]
    fn error_body_revision_mismatch_is_a_restart() {
        let item =
            translate_error_body("http://b", br#"{"error":"error","reason":"revision_mismatch"}"#);
        assert!(matches!(item, QueueItem::RevisionMismatch));
    }

    #[test]
    fn error_body_outdated_view_is_fatal() {
        let item =
            translate_error_body("http://b", br#"{"error":"error","reason":"set_view_outdated"}"#);
        assert!(matches!(item, QueueItem::SetViewOutdated));
    }

    #[test]
    fn error_body_unknown_shape_is_stringified() {
        let item = translate_error_body("http://b", br#"{"code":500}"#);
        assert!(matches!(item, QueueItem::Error { reason, .. } if reason.contains("500")));
    }

    #[test]
    fn error_body_not_json_passes_raw_text() {
        let item = translate_error_body("http://b", b"gateway exploded");
        assert!(matches!(item, QueueItem::Error { reason, .. } if reason == "gateway exploded"));
    }
}
