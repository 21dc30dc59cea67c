use std::future::Future;
use std::pin::Pin;

use futures::future::BoxFuture;

pub mod error;
pub mod identity;
pub mod ids;
pub mod memory;
pub mod records;
pub mod remote;
pub mod repository;
pub mod types;

pub use error::{StoreError, StoreErrorKind, StoreResult};
pub use identity::{IdentityError, UserIdentity};
pub use ids::ConversationId;
pub use memory::MemoryRemoteStore;
pub use records::{RemoteConversationRecord, RemoteLatestMessage, user_node_path};
pub use remote::{RemoteStore, RemoteWatch};
pub use repository::{
    ConversationUpdates, DEFAULT_FETCH_TIMEOUT, DEFAULT_PREVIEW_MAX_CHARS,
    RemoteConversationRepository, RepositoryConfig,
};
pub use types::{ConversationListSnapshot, ConversationSummary, LatestMessagePreview};

pub type UpdatesWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Live update subscription plus the worker that feeds it.
///
/// The caller decides where the worker runs, typically `tokio::spawn`.
pub struct ConversationUpdatesHandle {
    pub updates: ConversationUpdates,
    pub worker: UpdatesWorker,
}

/// Source of the conversation list of one user.
pub trait ConversationRepository: Send + Sync {
    /// One-shot read of every conversation `identity` participates in.
    ///
    /// A user with zero conversations yields an empty snapshot; `NotFound` is
    /// reserved for an identity the store does not know at all.
    fn fetch_all<'a>(
        &'a self,
        identity: &'a UserIdentity,
    ) -> BoxFuture<'a, StoreResult<ConversationListSnapshot>>;

    fn subscribe_to_updates(
        &self,
        identity: &UserIdentity,
    ) -> StoreResult<ConversationUpdatesHandle>;
}
