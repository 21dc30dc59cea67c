use chitchat_storage::{ConversationListSnapshot, StoreResult};
use tokio::sync::mpsc;

use super::state::{SubscriptionToken, ViewState};

/// Published every time the visible list changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewStateChanged {
    /// Subscription that produced the change; `None` while signed out.
    pub token: Option<SubscriptionToken>,
    pub view_state: ViewState,
}

/// Results posted back to the controller by its background tasks.
#[derive(Debug)]
pub enum ControllerInput {
    FetchCompleted {
        token: SubscriptionToken,
        result: StoreResult<ConversationListSnapshot>,
    },
    UpdateReceived {
        token: SubscriptionToken,
        result: StoreResult<ConversationListSnapshot>,
    },
}

impl ControllerInput {
    pub fn token(&self) -> SubscriptionToken {
        match self {
            Self::FetchCompleted { token, .. } | Self::UpdateReceived { token, .. } => *token,
        }
    }
}

/// Stream of [`ViewStateChanged`] for one listener.
///
/// The current view is delivered first, then every later change.
pub struct ViewStateEvents {
    events: mpsc::UnboundedReceiver<ViewStateChanged>,
}

impl ViewStateEvents {
    pub fn new(events: mpsc::UnboundedReceiver<ViewStateChanged>) -> Self {
        Self { events }
    }

    /// `None` once the service has stopped.
    pub async fn recv(&mut self) -> Option<ViewStateChanged> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ViewStateChanged> {
        self.events.try_recv().ok()
    }

    /// Skips `Loading` and returns the next settled view.
    pub async fn next_settled(&mut self) -> Option<ViewStateChanged> {
        while let Some(event) = self.recv().await {
            if !event.view_state.is_loading() {
                return Some(event);
            }
        }
        None
    }
}
