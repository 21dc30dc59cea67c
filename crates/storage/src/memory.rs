use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::error::{InvalidRecordSnafu, NetworkSnafu, StoreResult};
use super::remote::{RemoteStore, RemoteWatch, path_segments};

/// In-process [`RemoteStore`] holding the whole tree in memory.
///
/// Clones share the same tree. Writes notify every watch whose path is an
/// ancestor or descendant of the written path. The store can be switched
/// offline and given an artificial read latency to exercise failure paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Mutex<MemoryTree>>,
}

#[derive(Debug)]
struct MemoryTree {
    root: Value,
    watchers: Vec<Watcher>,
    offline: bool,
    read_latency: Option<Duration>,
    read_count: u64,
}

#[derive(Debug)]
struct Watcher {
    segments: Vec<String>,
    sender: mpsc::UnboundedSender<StoreResult<Option<Value>>>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
            watchers: Vec::new(),
            offline: false,
            read_latency: None,
            read_count: 0,
        }
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: Value) -> Self {
        let store = Self::default();
        store.tree().root = root;
        store
    }

    /// Current value at `path`, bypassing latency and offline simulation.
    pub fn get(&self, path: &str) -> Option<Value> {
        lookup(&self.tree().root, &path_segments(path)).cloned()
    }

    pub fn set(&self, path: &str, value: Value) -> StoreResult<()> {
        let segments = path_segments(path);
        let mut tree = self.tree();
        let slot = slot_mut(&mut tree.root, &segments, path)?;
        *slot = value;
        tree.notify(&segments);
        Ok(())
    }

    /// Removes the node at `path`. Array elements leave a `null` hole.
    pub fn remove(&self, path: &str) {
        let segments = path_segments(path);
        let mut tree = self.tree();

        match segments.split_last() {
            None => tree.root = Value::Object(Map::new()),
            Some((last, parents)) => {
                let Some(parent) = lookup_mut(&mut tree.root, parents) else {
                    return;
                };
                match parent {
                    Value::Object(fields) => {
                        fields.remove(*last);
                    }
                    Value::Array(items) => {
                        if let Some(item) = last
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| items.get_mut(index))
                        {
                            *item = Value::Null;
                        }
                    }
                    _ => return,
                }
            }
        }

        tree.notify(&segments);
    }

    pub fn set_offline(&self, offline: bool) {
        self.tree().offline = offline;
    }

    pub fn set_read_latency(&self, latency: Option<Duration>) {
        self.tree().read_latency = latency;
    }

    pub fn read_count(&self) -> u64 {
        self.tree().read_count
    }

    /// Number of watches still held by a receiver.
    pub fn active_watchers(&self) -> usize {
        let mut tree = self.tree();
        tree.watchers.retain(|watcher| !watcher.sender.is_closed());
        tree.watchers.len()
    }

    fn tree(&self) -> MutexGuard<'_, MemoryTree> {
        // Every mutation completes before the guard drops, so a poisoned tree is still whole.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn read<'a>(&'a self, path: &'a str) -> BoxFuture<'a, StoreResult<Option<Value>>> {
        async move {
            let latency = {
                let mut tree = self.tree();
                tree.read_count += 1;
                tree.read_latency
            };

            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let tree = self.tree();
            if tree.offline {
                return NetworkSnafu {
                    stage: "memory-read",
                    details: format!("remote store is offline, cannot read '{path}'"),
                }
                .fail();
            }

            Ok(lookup(&tree.root, &path_segments(path))
                .filter(|value| !value.is_null())
                .cloned())
        }
        .boxed()
    }

    fn watch(&self, path: &str) -> StoreResult<RemoteWatch> {
        let mut tree = self.tree();
        if tree.offline {
            return NetworkSnafu {
                stage: "memory-watch",
                details: format!("remote store is offline, cannot watch '{path}'"),
            }
            .fail();
        }

        let segments = path_segments(path);
        let (sender, receiver) = mpsc::unbounded_channel();
        let current = lookup(&tree.root, &segments)
            .filter(|value| !value.is_null())
            .cloned();
        // A closed receiver is impossible here: it is returned below.
        let _ = sender.send(Ok(current));

        tree.watchers.push(Watcher {
            segments: segments.iter().map(|segment| segment.to_string()).collect(),
            sender,
        });

        Ok(RemoteWatch::new(path, receiver))
    }
}

impl MemoryTree {
    fn notify(&mut self, written: &[&str]) {
        let root = &self.root;
        self.watchers.retain(|watcher| {
            if watcher.sender.is_closed() {
                return false;
            }
            if !paths_overlap(&watcher.segments, written) {
                return true;
            }

            let segments = watcher
                .segments
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>();
            let value = lookup(root, &segments)
                .filter(|value| !value.is_null())
                .cloned();
            watcher.sender.send(Ok(value)).is_ok()
        });
    }
}

fn paths_overlap(watched: &[String], written: &[&str]) -> bool {
    watched
        .iter()
        .zip(written.iter())
        .all(|(left, right)| left == right)
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |node, segment| match node {
        Value::Object(fields) => fields.get(*segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, segments: &[&str]) -> Option<&'a mut Value> {
    segments.iter().try_fold(root, |node, segment| match node {
        Value::Object(fields) => fields.get_mut(*segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get_mut(index)),
        _ => None,
    })
}

/// Walks to `segments`, creating missing nodes and padding arrays.
///
/// A missing node becomes an array when the segment indexing into it is
/// numeric, otherwise an object.
fn slot_mut<'a>(root: &'a mut Value, segments: &[&str], path: &str) -> StoreResult<&'a mut Value> {
    let mut node = root;

    for segment in segments {
        if !node.is_object() && !node.is_array() {
            *node = if segment.parse::<usize>().is_ok() {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            };
        }

        node = match node {
            Value::Array(items) => {
                let Ok(index) = segment.parse::<usize>() else {
                    return InvalidRecordSnafu {
                        stage: "memory-set-array-index",
                        path: path.to_string(),
                        details: format!("segment '{segment}' is not an array index"),
                    }
                    .fail();
                };
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
                &mut items[index]
            }
            Value::Object(fields) => fields.entry(segment.to_string()).or_insert(Value::Null),
            _ => unreachable!("node was normalized to an object or array above"),
        };
    }

    Ok(node)
}
