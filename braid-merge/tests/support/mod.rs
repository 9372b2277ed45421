//! Shared fixtures: a numeric test index module, a scripted design-doc
//! store, an event-recording sink, and a mock remote merge server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use serde_json::{Value, json};

use braid_merge::collector::{MergeEvent, MergeSink, Step};
use braid_merge::ddoc::{DesignDoc, DesignDocStore};
use braid_merge::error::{MergeError, Result};
use braid_merge::index::{
    HttpQueryParams, IndexModule, IndexSpec, LocalSpec, MergeFuns, RemoteMergeBody, RemoteSpec,
};
use braid_merge::queue::{QueueItem, QueueProducer, RowOrder};

/// Index module over in-memory numeric rows, one row set per set name.
#[derive(Default)]
pub struct TestModule {
    pub sets: HashMap<String, Vec<i64>>,
    pub fast_path_used: AtomicBool,
}

impl TestModule {
    pub fn with_sets(sets: &[(&str, &[i64])]) -> Self {
        Self {
            sets: sets
                .iter()
                .map(|(name, rows)| ((*name).to_owned(), rows.to_vec()))
                .collect(),
            fast_path_used: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl IndexModule for TestModule {
    fn name(&self) -> &str {
        "mapview"
    }

    fn parse_http_params(
        &self,
        raw: &[(String, String)],
        _ddoc: &DesignDoc,
        _view_name: &str,
    ) -> Result<HttpQueryParams> {
        Ok(HttpQueryParams(raw.to_vec()))
    }

    fn view_query_string(&self, params: &HttpQueryParams) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in &params.0 {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    fn process_extra_params(
        &self,
        _extra: Option<&Value>,
        _body: &mut RemoteMergeBody,
    ) -> Result<()> {
        Ok(())
    }

    fn make_funs(
        &self,
        _ddoc: &DesignDoc,
        _view_name: &str,
        _params: &HttpQueryParams,
    ) -> Result<MergeFuns> {
        Ok(MergeFuns {
            order: RowOrder::Ordered(std::sync::Arc::new(|a: &Value, b: &Value| {
                a.as_i64().unwrap_or(0).cmp(&b.as_i64().unwrap_or(0))
            })),
            preprocess: None,
            extra: None,
        })
    }

    fn skip_and_limit(&self, _params: &HttpQueryParams) -> (u64, u64) {
        (0, u64::MAX)
    }

    fn map_remote_row(&self, row: Value) -> QueueItem {
        QueueItem::Row(row)
    }

    async fn fold_local(
        &self,
        spec: &LocalSpec,
        _funs: &MergeFuns,
        producer: &QueueProducer,
    ) -> Result<()> {
        let rows = self.sets.get(&spec.set_name).cloned().ok_or_else(|| {
            MergeError::NotFound(format!("no such set: {}", spec.set_name))
        })?;
        producer
            .push(QueueItem::RowCount(rows.len() as u64))
            .await
            .map_err(|_| MergeError::QueueShutdown)?;
        for row in rows {
            producer
                .push(QueueItem::Row(json!(row)))
                .await
                .map_err(|_| MergeError::QueueShutdown)?;
        }
        Ok(())
    }

    async fn simple_query(
        &self,
        spec: &LocalSpec,
        _ddoc: &DesignDoc,
        _params: &HttpQueryParams,
        sink: &mut dyn MergeSink,
    ) -> Result<()> {
        self.fast_path_used.store(true, Ordering::SeqCst);
        let rows = self.sets.get(&spec.set_name).cloned().unwrap_or_default();
        if sink.on_event(MergeEvent::Start {
            total_rows: rows.len() as u64,
        }) == Step::Stop
        {
            return Ok(());
        }
        for row in rows {
            if sink.on_event(MergeEvent::Row(json!(row))) == Step::Stop {
                return Ok(());
            }
        }
        sink.on_event(MergeEvent::Stop);
        Ok(())
    }
}

/// Store whose revision advances once per call until the script runs out.
pub struct ScriptedStore {
    revisions: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn with_revisions(revisions: &[&str]) -> Self {
        Self {
            revisions: Mutex::new(revisions.iter().map(|r| (*r).to_owned()).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DesignDocStore for ScriptedStore {
    async fn get_ddoc(&self, _set_name: &str, ddoc_id: &str) -> Result<DesignDoc> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut revisions = self.revisions.lock().unwrap();
        let revision = if revisions.len() > 1 {
            revisions.remove(0)
        } else {
            revisions
                .first()
                .cloned()
                .ok_or_else(|| MergeError::NotFound(ddoc_id.to_owned()))?
        };
        Ok(DesignDoc {
            id: ddoc_id.to_owned(),
            revision,
            body: json!({}),
        })
    }
}

/// Records every event as a compact label.
#[derive(Default)]
pub struct CollectingSink {
    pub events: Vec<String>,
    pub stop_after: Option<usize>,
}

impl MergeSink for CollectingSink {
    fn on_event(&mut self, event: MergeEvent) -> Step {
        let label = match event {
            MergeEvent::Start { total_rows } => format!("start:{total_rows}"),
            MergeEvent::Row(row) => format!("row:{row}"),
            MergeEvent::Error { source, reason } => format!("error:{source}:{reason}"),
            MergeEvent::DebugInfo { source, .. } => format!("debug:{source}"),
            MergeEvent::Stop => "stop".to_owned(),
        };
        self.events.push(label);
        match self.stop_after {
            Some(n) if self.events.len() >= n => Step::Stop,
            _ => Step::Continue,
        }
    }
}

/// Serve a router on an ephemeral port.
pub async fn serve(router: Router) -> SocketAddr {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub fn local_spec(set_name: &str) -> IndexSpec {
    IndexSpec::Local(LocalSpec {
        set_name: set_name.to_owned(),
        ddoc_id: "_design/test".to_owned(),
        view_name: "by_key".to_owned(),
    })
}

pub fn remote_spec(addr: SocketAddr) -> IndexSpec {
    IndexSpec::Remote(RemoteSpec {
        url: url::Url::parse(&format!("http://{addr}/merge")).unwrap(),
        body: RemoteMergeBody::default(),
        ssl_params: None,
    })
}

pub fn remote_url(addr: SocketAddr) -> String {
    format!("http://{addr}/merge")
}
