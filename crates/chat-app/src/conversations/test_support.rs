use std::collections::HashMap;
use std::sync::Mutex;

use chitchat_storage::{
    ConversationListSnapshot, ConversationRepository, ConversationUpdatesHandle, StoreResult,
    UserIdentity,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

type Gate = oneshot::Receiver<StoreResult<ConversationListSnapshot>>;
pub(crate) type Release = oneshot::Sender<StoreResult<ConversationListSnapshot>>;

/// Fetches block until the test releases the gate registered for the identity.
///
/// Ungated identities resolve to an empty list at once.
#[derive(Default)]
pub(crate) struct GatedRepository {
    gates: Mutex<HashMap<String, Gate>>,
}

impl GatedRepository {
    pub(crate) fn gate(&self, identity: &UserIdentity) -> Release {
        let (sender, receiver) = oneshot::channel();
        self.gates
            .lock()
            .expect("gates lock")
            .insert(identity.as_key().to_string(), receiver);
        sender
    }
}

impl ConversationRepository for GatedRepository {
    fn fetch_all<'a>(
        &'a self,
        identity: &'a UserIdentity,
    ) -> BoxFuture<'a, StoreResult<ConversationListSnapshot>> {
        let gate = self.gates.lock().expect("gates lock").remove(identity.as_key());
        async move {
            match gate {
                Some(gate) => gate
                    .await
                    .unwrap_or_else(|_| Ok(ConversationListSnapshot::empty(identity.clone()))),
                None => Ok(ConversationListSnapshot::empty(identity.clone())),
            }
        }
        .boxed()
    }

    fn subscribe_to_updates(
        &self,
        identity: &UserIdentity,
    ) -> StoreResult<ConversationUpdatesHandle> {
        panic!("live updates are disabled with gated fetches, got {identity}");
    }
}
