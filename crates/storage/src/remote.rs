use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use super::error::StoreResult;

/// Path-addressed JSON tree in the style of a realtime database.
///
/// Paths are `/`-separated keys; array elements are addressed by index.
/// A missing node and an explicit `null` both read as `None`.
pub trait RemoteStore: Send + Sync {
    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>>;

    /// Starts a value watch on `path`.
    ///
    /// The current value is delivered first, then one value per change at or
    /// below `path`. Dropping or closing the watch unregisters it.
    fn watch(&self, path: &str) -> StoreResult<RemoteWatch>;
}

/// Receiving side of a value watch.
pub struct RemoteWatch {
    path: String,
    values: mpsc::UnboundedReceiver<StoreResult<Option<Value>>>,
}

impl RemoteWatch {
    pub fn new(
        path: impl Into<String>,
        values: mpsc::UnboundedReceiver<StoreResult<Option<Value>>>,
    ) -> Self {
        Self {
            path: path.into(),
            values,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn recv(&mut self) -> Option<StoreResult<Option<Value>>> {
        self.values.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StoreResult<Option<Value>>> {
        self.values.try_recv().ok()
    }

    /// Stops delivery; already queued values can still be drained.
    pub fn close(&mut self) {
        self.values.close();
    }
}

/// Splits a store path into its non-empty segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect()
}
