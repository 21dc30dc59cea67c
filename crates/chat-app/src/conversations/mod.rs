//! Conversation list sync: state machine, controller, and the service task
//! that drives them.

mod controller;
mod events;
mod service;
mod state;
#[cfg(test)]
mod test_support;

pub use controller::{ConversationListController, ControllerOptions};
pub use events::{ControllerInput, ViewStateChanged, ViewStateEvents};
pub use service::{ConversationListHandle, ConversationListService, ServiceError, ServiceResult};
pub use state::{
    SubscriptionToken, SyncPhase, SyncState, SyncTransition, SyncTransitionRejection,
    SyncTransitionResult, ViewState,
};
