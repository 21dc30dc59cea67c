use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::error::{FetchTimeoutSnafu, StoreErrorKind, StoreResult};
use super::identity::UserIdentity;
use super::ids::ConversationId;
use super::records::{decode_user_node, user_node_path};
use super::remote::{RemoteStore, RemoteWatch};
use super::types::{ConversationListSnapshot, ConversationSummary, LatestMessagePreview};
use super::{ConversationRepository, ConversationUpdatesHandle, UpdatesWorker};

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PREVIEW_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Upper bound for one `fetch_all`; `None` waits forever.
    pub fetch_timeout: Option<Duration>,
    /// Preview text length in characters; `0` disables truncation.
    pub preview_max_chars: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            preview_max_chars: DEFAULT_PREVIEW_MAX_CHARS,
        }
    }
}

/// [`ConversationRepository`] reading the conversation tree of a [`RemoteStore`].
///
/// Read-only: nothing here writes back to the store, and failures are returned
/// as-is without retrying.
pub struct RemoteConversationRepository {
    store: Arc<dyn RemoteStore>,
    config: RepositoryConfig,
    ledger: Arc<PreviewLedger>,
}

impl RemoteConversationRepository {
    pub fn new(store: Arc<dyn RemoteStore>, config: RepositoryConfig) -> Self {
        Self {
            store,
            config,
            ledger: Arc::new(PreviewLedger::default()),
        }
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    async fn read_user_node(&self, identity: &UserIdentity) -> StoreResult<Option<Value>> {
        let path = user_node_path(identity);
        let read = self.store.read(&path);

        let Some(timeout) = self.config.fetch_timeout else {
            return read.await;
        };

        match tokio::time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_elapsed) => FetchTimeoutSnafu {
                stage: "fetch-all-timeout",
                identity: identity.as_key().to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .fail(),
        }
    }
}

impl ConversationRepository for RemoteConversationRepository {
    fn fetch_all<'a>(
        &'a self,
        identity: &'a UserIdentity,
    ) -> BoxFuture<'a, StoreResult<ConversationListSnapshot>> {
        async move {
            let node = self.read_user_node(identity).await?;
            let snapshot = build_snapshot(
                identity,
                node.as_ref(),
                self.config.preview_max_chars,
                &self.ledger,
            )?;
            tracing::debug!(
                identity = %identity,
                conversation_count = snapshot.len(),
                "fetched conversation list"
            );
            Ok(snapshot)
        }
        .boxed()
    }

    fn subscribe_to_updates(
        &self,
        identity: &UserIdentity,
    ) -> StoreResult<ConversationUpdatesHandle> {
        let watch = self.store.watch(&user_node_path(identity))?;
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let worker: UpdatesWorker = forward_updates(
            identity.clone(),
            watch,
            update_tx,
            cancel_rx,
            self.config.preview_max_chars,
            Arc::clone(&self.ledger),
        )
        .boxed();

        Ok(ConversationUpdatesHandle {
            updates: ConversationUpdates::new(identity.clone(), update_rx, cancel_tx),
            worker,
        })
    }
}

/// Live conversation snapshots for one identity.
///
/// Dropping the stream, or calling [`ConversationUpdates::unsubscribe`], stops
/// the worker and releases the remote watch.
pub struct ConversationUpdates {
    owner: UserIdentity,
    updates: mpsc::UnboundedReceiver<StoreResult<ConversationListSnapshot>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl ConversationUpdates {
    pub(crate) fn new(
        owner: UserIdentity,
        updates: mpsc::UnboundedReceiver<StoreResult<ConversationListSnapshot>>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            owner,
            updates,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn owner(&self) -> &UserIdentity {
        &self.owner
    }

    pub async fn recv(&mut self) -> Option<StoreResult<ConversationListSnapshot>> {
        self.updates.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StoreResult<ConversationListSnapshot>> {
        self.updates.try_recv().ok()
    }

    /// Returns false when the subscription was already torn down.
    pub fn unsubscribe(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ConversationUpdates {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

async fn forward_updates(
    owner: UserIdentity,
    mut watch: RemoteWatch,
    update_tx: mpsc::UnboundedSender<StoreResult<ConversationListSnapshot>>,
    mut cancel_rx: oneshot::Receiver<()>,
    preview_max_chars: usize,
    ledger: Arc<PreviewLedger>,
) {
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(identity = %owner, path = watch.path(), "conversation updates cancelled");
                break;
            }
            next = watch.recv() => {
                let Some(node) = next else {
                    tracing::debug!(identity = %owner, "remote watch ended");
                    break;
                };

                let update = node.and_then(|node| {
                    build_snapshot(&owner, node.as_ref(), preview_max_chars, &ledger)
                });
                if update_tx.send(update).is_err() {
                    break;
                }
            }
        }
    }

    watch.close();
}

fn build_snapshot(
    owner: &UserIdentity,
    node: Option<&Value>,
    preview_max_chars: usize,
    ledger: &PreviewLedger,
) -> StoreResult<ConversationListSnapshot> {
    let decoded = match decode_user_node(owner, node, preview_max_chars) {
        Ok(decoded) => decoded,
        Err(error) => {
            if error.kind() == StoreErrorKind::NotFound {
                ledger.forget(owner);
            }
            return Err(error);
        }
    };

    let (snapshot, dropped) = decoded.into_snapshot(owner.clone());
    if dropped > 0 {
        tracing::warn!(
            identity = %owner,
            dropped,
            "remote conversation list contained duplicate ids"
        );
    }

    // Only rows that survived deduplication may feed the ledger.
    let mut summaries = snapshot.conversations().to_vec();
    let held_back = ledger.reconcile(owner, &mut summaries);
    if held_back == 0 {
        return Ok(snapshot);
    }

    tracing::debug!(
        identity = %owner,
        held_back,
        "kept newer previews over stale remote values"
    );
    let (snapshot, _) = ConversationListSnapshot::from_summaries(owner.clone(), summaries);
    Ok(snapshot)
}

/// Newest preview observed per conversation, per viewing identity.
#[derive(Debug, Default)]
pub(crate) struct PreviewLedger {
    entries: Mutex<HashMap<UserIdentity, HashMap<ConversationId, LatestMessagePreview>>>,
}

impl PreviewLedger {
    /// Replaces previews older than the newest one seen and records the rest.
    /// Conversations absent from `summaries` are forgotten.
    ///
    /// Returns how many previews were held back.
    pub(crate) fn reconcile(
        &self,
        owner: &UserIdentity,
        summaries: &mut [ConversationSummary],
    ) -> usize {
        let mut entries = self.entries();
        let seen = entries.entry(owner.clone()).or_default();
        let mut held_back = 0;

        for summary in summaries.iter_mut() {
            match seen.get(&summary.conversation_id) {
                Some(newest) if summary.latest_message.is_older_than(newest) => {
                    summary.latest_message = newest.clone();
                    held_back += 1;
                }
                _ => {
                    seen.insert(
                        summary.conversation_id.clone(),
                        summary.latest_message.clone(),
                    );
                }
            }
        }

        seen.retain(|conversation_id, _| {
            summaries
                .iter()
                .any(|summary| &summary.conversation_id == conversation_id)
        });
        if seen.is_empty() {
            entries.remove(owner);
        }

        held_back
    }

    /// Drops every preview recorded for `owner`.
    pub(crate) fn forget(&self, owner: &UserIdentity) {
        self.entries().remove(owner);
    }

    #[cfg(test)]
    pub(crate) fn tracked_conversations(&self, owner: &UserIdentity) -> usize {
        self.entries().get(owner).map_or(0, HashMap::len)
    }

    fn entries(
        &self,
    ) -> MutexGuard<'_, HashMap<UserIdentity, HashMap<ConversationId, LatestMessagePreview>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::{StoreError, StoreErrorKind};
    use crate::memory::MemoryRemoteStore;

    fn identity(raw: &str) -> UserIdentity {
        UserIdentity::parse(raw).expect("valid identity")
    }

    fn record(id: &str, name: &str, text: &str, date: u64, is_read: bool) -> Value {
        json!({
            "id": id,
            "name": name,
            "other_user_email": format!("{}@peer.org", name.to_lowercase()),
            "latest_message": { "date": date, "message": text, "is_read": is_read }
        })
    }

    fn repository(store: &MemoryRemoteStore) -> RemoteConversationRepository {
        RemoteConversationRepository::new(Arc::new(store.clone()), RepositoryConfig::default())
    }

    #[tokio::test]
    async fn fetch_all_returns_store_order() {
        let store = MemoryRemoteStore::new();
        store
            .set(
                "a-x-com/conversations",
                json!([
                    record("c1", "Doctor", "Hello World", 20, false),
                    record("c2", "IT", "Ticket closed", 10, true),
                ]),
            )
            .expect("seed");

        let snapshot = repository(&store)
            .fetch_all(&identity("A@X.com"))
            .await
            .expect("fetch succeeds");

        let names = snapshot
            .iter()
            .map(|summary| summary.display_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["Doctor", "IT"]);
        assert_eq!(snapshot.owner().as_key(), "a-x-com");
    }

    #[tokio::test]
    async fn zero_conversations_is_an_empty_snapshot_and_unknown_user_is_not_found() {
        let store = MemoryRemoteStore::new();
        store.set("a-x-com/name", json!("A")).expect("seed");
        let repository = repository(&store);

        let empty = repository
            .fetch_all(&identity("a@x.com"))
            .await
            .expect("known user fetches");
        assert!(empty.is_empty());

        let missing = repository
            .fetch_all(&identity("ghost@x.com"))
            .await
            .err()
            .expect("unknown user fails");
        assert_eq!(missing.kind(), StoreErrorKind::NotFound);
    }

    #[tokio::test]
    async fn duplicate_conversation_ids_are_dropped() {
        let store = MemoryRemoteStore::new();
        store
            .set(
                "a-x-com/conversations",
                json!([
                    record("c1", "Doctor", "first", 20, false),
                    record("c1", "Doctor", "again", 20, false),
                    record("c2", "IT", "other", 10, true),
                ]),
            )
            .expect("seed");

        let snapshot = repository(&store)
            .fetch_all(&identity("a@x.com"))
            .await
            .expect("fetch succeeds");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot.get("c1").map(|summary| summary.latest_message.text.as_str()),
            Some("first")
        );
    }

    #[tokio::test]
    async fn network_and_decode_failures_surface_unchanged() {
        let store = MemoryRemoteStore::new();
        store
            .set("a-x-com/conversations", json!([{ "id": "c1" }]))
            .expect("seed");
        let repository = repository(&store);

        let decode = repository
            .fetch_all(&identity("a@x.com"))
            .await
            .err()
            .expect("malformed record fails");
        assert!(matches!(decode, StoreError::Decode { .. }));

        store.set_offline(true);
        let network = repository
            .fetch_all(&identity("a@x.com"))
            .await
            .err()
            .expect("offline store fails");
        assert_eq!(network.kind(), StoreErrorKind::Network);
        assert_eq!(store.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reads_time_out_as_network_errors() {
        let store = MemoryRemoteStore::new();
        store.set("a-x-com/conversations", json!([])).expect("seed");
        store.set_read_latency(Some(Duration::from_secs(30)));

        let repository = RemoteConversationRepository::new(
            Arc::new(store.clone()),
            RepositoryConfig {
                fetch_timeout: Some(Duration::from_millis(250)),
                ..RepositoryConfig::default()
            },
        );

        let error = repository
            .fetch_all(&identity("a@x.com"))
            .await
            .err()
            .expect("slow read times out");
        assert!(matches!(
            error,
            StoreError::FetchTimeout {
                timeout_ms: 250,
                ..
            }
        ));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn previews_never_move_backwards_across_fetches() {
        let store = MemoryRemoteStore::new();
        store
            .set(
                "a-x-com/conversations",
                json!([record("c1", "Doctor", "newest", 200, false)]),
            )
            .expect("seed");
        let repository = repository(&store);
        let owner = identity("a@x.com");

        repository.fetch_all(&owner).await.expect("first fetch");

        // A lagging replica serves an older latest message.
        store
            .set(
                "a-x-com/conversations",
                json!([record("c1", "Doctor", "older", 100, true)]),
            )
            .expect("regress");
        let regressed = repository.fetch_all(&owner).await.expect("second fetch");
        assert_eq!(regressed.conversations()[0].latest_message.text, "newest");
        assert_eq!(regressed.conversations()[0].latest_message.sent_at_unix_seconds, 200);

        // Same timestamp is accepted so the read flag can flip.
        store
            .set(
                "a-x-com/conversations",
                json!([record("c1", "Doctor", "newest", 200, true)]),
            )
            .expect("mark read");
        let read = repository.fetch_all(&owner).await.expect("third fetch");
        assert!(read.conversations()[0].latest_message.is_read);
    }

    #[tokio::test]
    async fn dropped_duplicates_do_not_feed_the_preview_ledger() {
        let store = MemoryRemoteStore::new();
        store
            .set(
                "a-x-com/conversations",
                json!([
                    record("c1", "Doctor", "shown", 100, false),
                    record("c1", "Doctor", "duplicate", 300, false),
                ]),
            )
            .expect("seed");
        let repository = repository(&store);
        let owner = identity("a@x.com");

        let first = repository.fetch_all(&owner).await.expect("first fetch");
        assert_eq!(first.conversations()[0].latest_message.text, "shown");

        store
            .set(
                "a-x-com/conversations",
                json!([record("c1", "Doctor", "real newer message", 200, false)]),
            )
            .expect("newer message");
        let second = repository.fetch_all(&owner).await.expect("second fetch");
        let preview = &second.conversations()[0].latest_message;
        assert_eq!(preview.text, "real newer message");
        assert_eq!(preview.sent_at_unix_seconds, 200);
    }

    #[tokio::test]
    async fn ledger_forgets_conversations_that_leave_the_store() {
        let store = MemoryRemoteStore::new();
        store
            .set(
                "a-x-com/conversations",
                json!([
                    record("c1", "Doctor", "hi", 100, false),
                    record("c2", "IT", "ticket", 100, false),
                ]),
            )
            .expect("seed");
        let repository = repository(&store);
        let owner = identity("a@x.com");

        repository.fetch_all(&owner).await.expect("first fetch");
        assert_eq!(repository.ledger.tracked_conversations(&owner), 2);

        store
            .set("a-x-com/conversations", json!([record("c2", "IT", "ticket", 100, false)]))
            .expect("drop c1");
        repository.fetch_all(&owner).await.expect("second fetch");
        assert_eq!(repository.ledger.tracked_conversations(&owner), 1);

        store.remove("a-x-com");
        let missing = repository.fetch_all(&owner).await.expect_err("user removed");
        assert_eq!(missing.kind(), StoreErrorKind::NotFound);
        assert_eq!(repository.ledger.tracked_conversations(&owner), 0);
    }

    #[tokio::test]
    async fn ledger_is_scoped_per_viewer() {
        let store = MemoryRemoteStore::new();
        store
            .set("a-x-com/conversations", json!([record("c1", "B", "new", 200, false)]))
            .expect("seed a");
        store
            .set("b-y-com/conversations", json!([record("c1", "A", "old", 100, true)]))
            .expect("seed b");
        let repository = repository(&store);

        repository.fetch_all(&identity("a@x.com")).await.expect("fetch a");
        let other_side = repository
            .fetch_all(&identity("b@y.com"))
            .await
            .expect("fetch b");

        assert_eq!(other_side.conversations()[0].latest_message.text, "old");
    }

    #[tokio::test]
    async fn updates_stream_current_value_then_changes() {
        let store = MemoryRemoteStore::new();
        store
            .set("a-x-com/conversations", json!([record("c1", "Doctor", "hi", 10, false)]))
            .expect("seed");
        let repository = repository(&store);

        let handle = repository
            .subscribe_to_updates(&identity("a@x.com"))
            .expect("subscribe");
        let mut updates = handle.updates;
        let worker = tokio::spawn(handle.worker);

        let first = updates.recv().await.expect("initial value").expect("decodes");
        assert_eq!(first.len(), 1);

        store
            .set(
                "a-x-com/conversations/1",
                record("c2", "IT", "new thread", 20, false),
            )
            .expect("append");
        let second = updates.recv().await.expect("change").expect("decodes");
        assert_eq!(second.len(), 2);
        assert_eq!(second.conversations()[1].conversation_id.as_str(), "c2");

        assert!(updates.unsubscribe());
        worker.await.expect("worker exits after unsubscribe");
        assert_eq!(store.active_watchers(), 0);
        assert!(!updates.unsubscribe());
    }

    #[tokio::test]
    async fn dropping_updates_releases_the_watch() {
        let store = MemoryRemoteStore::new();
        let repository = repository(&store);

        let handle = repository
            .subscribe_to_updates(&identity("a@x.com"))
            .expect("subscribe");
        let worker = tokio::spawn(handle.worker);
        drop(handle.updates);

        worker.await.expect("worker exits after drop");
        assert_eq!(store.active_watchers(), 0);
    }

    #[tokio::test]
    async fn update_errors_are_forwarded_without_ending_the_stream() {
        let store = MemoryRemoteStore::new();
        store.set("a-x-com/conversations", json!([])).expect("seed");
        let repository = repository(&store);

        let handle = repository
            .subscribe_to_updates(&identity("a@x.com"))
            .expect("subscribe");
        let mut updates = handle.updates;
        tokio::spawn(handle.worker);

        assert!(updates.recv().await.expect("initial").is_ok());

        store
            .set("a-x-com/conversations", json!(["not a record"]))
            .expect("corrupt");
        let error = updates.recv().await.expect("error delivered").err().expect("decode error");
        assert_eq!(error.kind(), StoreErrorKind::Decode);

        store
            .set("a-x-com/conversations", json!([record("c1", "Doctor", "fixed", 5, false)]))
            .expect("repair");
        let repaired = updates.recv().await.expect("recovered").expect("decodes");
        assert_eq!(repaired.len(), 1);
    }
}
