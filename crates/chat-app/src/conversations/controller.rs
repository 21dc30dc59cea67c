use std::sync::Arc;

use arc_swap::ArcSwap;
use chitchat_storage::{
    ConversationListSnapshot, ConversationRepository, StoreError, StoreErrorKind, UserIdentity,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{ControllerInput, ViewStateChanged};
use super::state::{SubscriptionToken, SyncPhase, SyncState, SyncTransition, ViewState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Keep listening for remote changes after the first fetch.
    pub live_updates: bool,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { live_updates: true }
    }
}

/// Owns the sync state of the conversation list for one session.
///
/// Not thread-safe on its own: a single task feeds it session changes and the
/// [`ControllerInput`]s its background tasks post to `inbox`.
pub struct ConversationListController {
    repository: Arc<dyn ConversationRepository>,
    options: ControllerOptions,
    state: SyncState,
    last_token: SubscriptionToken,
    session_identity: Option<UserIdentity>,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    fetch_task: Option<JoinHandle<()>>,
    update_tasks: Vec<JoinHandle<()>>,
    published: Arc<ArcSwap<ViewState>>,
    listeners: Vec<mpsc::UnboundedSender<ViewStateChanged>>,
}

impl ConversationListController {
    pub fn new(
        repository: Arc<dyn ConversationRepository>,
        options: ControllerOptions,
        inbox: mpsc::UnboundedSender<ControllerInput>,
    ) -> Self {
        let state = SyncState::new();
        let published = Arc::new(ArcSwap::from_pointee(state.view().clone()));
        Self {
            repository,
            options,
            state,
            last_token: SubscriptionToken::new(0),
            session_identity: None,
            inbox,
            fetch_task: None,
            update_tasks: Vec::new(),
            published,
            listeners: Vec::new(),
        }
    }

    pub fn view_state(&self) -> &ViewState {
        self.state.view()
    }

    pub fn phase(&self) -> &SyncPhase {
        self.state.phase()
    }

    /// Lock-free copy of the view, updated on every change.
    pub fn published(&self) -> Arc<ArcSwap<ViewState>> {
        Arc::clone(&self.published)
    }

    /// Registers `listener` and sends it the current view right away.
    pub fn add_listener(&mut self, listener: mpsc::UnboundedSender<ViewStateChanged>) {
        let current = self.change_event();
        if listener.send(current).is_ok() {
            self.listeners.push(listener);
        }
    }

    /// Drops whatever subscription is active and starts loading `identity`.
    pub fn on_login(&mut self, identity: UserIdentity) -> SubscriptionToken {
        self.cancel_subscription();

        let token = self.last_token.next();
        self.last_token = token;
        self.session_identity = Some(identity.clone());

        tracing::info!("loading conversations for {identity} (subscription {})", token.0);
        self.apply(SyncTransition::Login {
            identity: identity.clone(),
            token,
        });
        self.spawn_fetch(identity, token);
        token
    }

    pub fn on_logout(&mut self) {
        self.cancel_subscription();
        if let Some(identity) = self.session_identity.take() {
            tracing::info!("cleared conversations of {identity}");
        }
        self.apply(SyncTransition::Logout);
    }

    /// Re-runs the login flow for the signed-in identity, if any.
    pub fn refresh(&mut self) -> Option<SubscriptionToken> {
        let identity = self.session_identity.clone()?;
        Some(self.on_login(identity))
    }

    pub fn handle_input(&mut self, input: ControllerInput) {
        let token = input.token();
        if !self.state.phase().accepts(token) {
            tracing::debug!(
                "discarding result of superseded subscription {} (active {:?})",
                token.0,
                self.state.phase().active_token()
            );
            return;
        }

        match input {
            ControllerInput::FetchCompleted { token, result } => {
                self.fetch_task = None;
                self.on_fetch_completed(token, result);
            }
            ControllerInput::UpdateReceived { token, result } => {
                self.on_update_received(token, result);
            }
        }
    }

    /// Stops background work and forgets every listener.
    pub fn teardown(&mut self) {
        self.cancel_subscription();
        self.listeners.clear();
    }

    fn on_fetch_completed(
        &mut self,
        token: SubscriptionToken,
        result: Result<ConversationListSnapshot, StoreError>,
    ) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(error) if error.kind() == StoreErrorKind::NotFound => {
                tracing::info!("{error}; showing an empty list");
                match self.state.phase().identity() {
                    Some(identity) => ConversationListSnapshot::empty(identity.clone()),
                    None => return,
                }
            }
            Err(error) => {
                log_failure("fetch conversations", &error);
                self.apply(SyncTransition::FetchFailed { token });
                return;
            }
        };

        tracing::debug!("fetched {} conversations", snapshot.len());
        if self.apply(SyncTransition::FetchSucceeded { token, snapshot }) {
            self.start_live_updates(token);
        }
    }

    fn on_update_received(
        &mut self,
        token: SubscriptionToken,
        result: Result<ConversationListSnapshot, StoreError>,
    ) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(error) if error.kind() == StoreErrorKind::NotFound => {
                match self.state.phase().identity() {
                    Some(identity) => ConversationListSnapshot::empty(identity.clone()),
                    None => return,
                }
            }
            Err(error) => {
                log_failure("apply live conversation update", &error);
                self.apply(SyncTransition::UpdateFailed { token });
                return;
            }
        };

        self.apply(SyncTransition::SnapshotUpdated { token, snapshot });
    }

    fn spawn_fetch(&mut self, identity: UserIdentity, token: SubscriptionToken) {
        let repository = Arc::clone(&self.repository);
        let inbox = self.inbox.clone();
        self.fetch_task = Some(tokio::spawn(async move {
            let result = repository.fetch_all(&identity).await;
            // The controller is gone when the inbox is closed; nothing to report to.
            let _ = inbox.send(ControllerInput::FetchCompleted { token, result });
        }));
    }

    fn start_live_updates(&mut self, token: SubscriptionToken) {
        if !self.options.live_updates {
            return;
        }
        let Some(identity) = self.state.phase().identity().cloned() else {
            return;
        };

        let handle = match self.repository.subscribe_to_updates(&identity) {
            Ok(handle) => handle,
            Err(error) => {
                log_failure("subscribe to conversation updates", &error);
                return;
            }
        };

        let mut updates = handle.updates;
        let inbox = self.inbox.clone();
        let relay = tokio::spawn(async move {
            while let Some(result) = updates.recv().await {
                if inbox
                    .send(ControllerInput::UpdateReceived { token, result })
                    .is_err()
                {
                    break;
                }
            }
        });

        self.update_tasks = vec![tokio::spawn(handle.worker), relay];
    }

    fn cancel_subscription(&mut self) {
        if let Some(task) = self.fetch_task.take() {
            task.abort();
        }
        for task in self.update_tasks.drain(..) {
            task.abort();
        }
    }

    /// Returns false when the transition was refused.
    fn apply(&mut self, transition: SyncTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                let changed = next.view() != self.state.view();
                self.state = next;
                if changed {
                    self.publish();
                }
                true
            }
            Err(rejection) => {
                tracing::warn!("ignored conversation sync transition: {rejection:?}");
                false
            }
        }
    }

    fn publish(&mut self) {
        self.published.store(Arc::new(self.state.view().clone()));
        let event = self.change_event();
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn change_event(&self) -> ViewStateChanged {
        ViewStateChanged {
            token: self.state.phase().active_token(),
            view_state: self.state.view().clone(),
        }
    }
}

impl Drop for ConversationListController {
    fn drop(&mut self) {
        self.cancel_subscription();
    }
}

fn log_failure(action: &str, error: &StoreError) {
    tracing::warn!(
        kind = ?error.kind(),
        retryable = error.is_retryable(),
        stage = error.stage(),
        "failed to {action}: {error}"
    );
}
