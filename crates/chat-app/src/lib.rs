//! Conversation list core of the chitchat client.
//!
//! A [`ConversationListService`] follows a [`SessionSource`], loads the
//! signed-in user's conversations from a
//! [`ConversationRepository`](chitchat_storage::ConversationRepository), keeps
//! them current while live updates arrive, and publishes a [`ViewState`] for
//! the presentation layer to render.

pub mod conversations;
pub mod session;
pub mod settings;

pub use conversations::{
    ConversationListHandle, ConversationListService, ControllerOptions, ServiceError,
    ViewState, ViewStateChanged, ViewStateEvents,
};
pub use session::{LocalSessionSource, SessionEvent, SessionEvents, SessionSource};
pub use settings::{SettingsStore, SyncSettings};
