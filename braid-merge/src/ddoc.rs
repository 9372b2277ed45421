use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// A versioned design document describing a view or index.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignDoc {
    pub id: String,
    pub revision: String,
    pub body: Value,
}

/// Authoritative design-document storage.
///
/// Revisions are compared by equality only; the merger never interprets
/// their contents.
#[async_trait]
pub trait DesignDocStore: Send + Sync {
    /// Fetch the current head of a design document, or
    /// [`MergeError::NotFound`](crate::MergeError::NotFound) when the set
    /// or the document does not exist.
    async fn get_ddoc(&self, set_name: &str, ddoc_id: &str) -> Result<DesignDoc>;
}
