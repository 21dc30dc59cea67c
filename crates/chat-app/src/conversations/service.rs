use std::sync::Arc;

use arc_swap::ArcSwap;
use chitchat_storage::{ConversationRepository, ConversationSummary, UserIdentity};
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::controller::{ConversationListController, ControllerOptions};
use super::events::{ControllerInput, ViewStateChanged, ViewStateEvents};
use super::state::ViewState;
use crate::session::{SessionEvent, SessionEvents, SessionSource};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServiceError {
    #[snafu(display("conversation list service has stopped (`{stage}`)"))]
    Stopped { stage: &'static str },
    #[snafu(display("conversation list task failed on `{stage}`: {source}"))]
    TaskJoin {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

enum ListCommand {
    Subscribe(mpsc::UnboundedSender<ViewStateChanged>),
    Refresh,
    Shutdown,
}

/// Background task that keeps a conversation list in sync with the session.
pub struct ConversationListService {
    handle: ConversationListHandle,
    task: JoinHandle<()>,
}

impl ConversationListService {
    /// Starts the service on the current tokio runtime.
    ///
    /// When `session` already has a signed-in user the first fetch starts
    /// immediately.
    pub fn spawn(
        repository: Arc<dyn ConversationRepository>,
        session: &dyn SessionSource,
        options: ControllerOptions,
    ) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let controller = ConversationListController::new(repository, options, inbox);
        let handle = ConversationListHandle {
            view: controller.published(),
            commands,
        };

        let session_events = session.subscribe();
        let initial_user = session.current_user();
        let task = tokio::spawn(run(
            controller,
            session_events,
            inbox_rx,
            commands_rx,
            initial_user,
        ));

        Self { handle, task }
    }

    pub fn handle(&self) -> ConversationListHandle {
        self.handle.clone()
    }

    /// Asks the loop to stop and waits for it.
    pub async fn shutdown(self) -> ServiceResult<()> {
        // Already stopped is fine here.
        let _ = self.handle.shutdown();
        self.task.await.context(TaskJoinSnafu {
            stage: "service-shutdown",
        })
    }
}

async fn run(
    mut controller: ConversationListController,
    mut session_events: SessionEvents,
    mut inbox: mpsc::UnboundedReceiver<ControllerInput>,
    mut commands: mpsc::UnboundedReceiver<ListCommand>,
    initial_user: Option<UserIdentity>,
) {
    if let Some(identity) = initial_user {
        controller.on_login(identity);
    }

    let mut session_open = true;
    loop {
        // Session changes are applied before queued task results.
        tokio::select! {
            biased;

            event = session_events.recv(), if session_open => match event {
                Some(SessionEvent::LoggedIn(identity)) => {
                    controller.on_login(identity);
                }
                Some(SessionEvent::LoggedOut) => controller.on_logout(),
                None => {
                    tracing::debug!("session source closed; keeping the current list");
                    session_open = false;
                }
            },
            command = commands.recv() => match command {
                Some(ListCommand::Subscribe(listener)) => controller.add_listener(listener),
                Some(ListCommand::Refresh) => {
                    if controller.refresh().is_none() {
                        tracing::debug!("refresh requested without a signed-in user");
                    }
                }
                Some(ListCommand::Shutdown) | None => break,
            },
            Some(input) = inbox.recv() => controller.handle_input(input),
        }
    }

    controller.teardown();
    tracing::debug!("conversation list service stopped");
}

/// Cheap, cloneable view of a running [`ConversationListService`].
///
/// Reads never wait on the service task.
#[derive(Clone)]
pub struct ConversationListHandle {
    view: Arc<ArcSwap<ViewState>>,
    commands: mpsc::UnboundedSender<ListCommand>,
}

impl ConversationListHandle {
    pub fn view_state(&self) -> Arc<ViewState> {
        self.view.load_full()
    }

    /// Looks up a row of the current list by conversation id.
    pub fn select_conversation(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.view
            .load()
            .snapshot()
            .and_then(|snapshot| snapshot.get(conversation_id).cloned())
    }

    /// Case-insensitive match on display name and preview text, in list order.
    pub fn search(&self, query: &str) -> Vec<ConversationSummary> {
        self.view
            .load()
            .snapshot()
            .map(|snapshot| snapshot.search(query))
            .unwrap_or_default()
    }

    pub fn unread_count(&self) -> usize {
        self.view
            .load()
            .snapshot()
            .map_or(0, |snapshot| snapshot.unread_count())
    }

    pub fn subscribe(&self) -> ServiceResult<ViewStateEvents> {
        let (listener, events) = mpsc::unbounded_channel();
        self.send(ListCommand::Subscribe(listener), "subscribe")?;
        Ok(ViewStateEvents::new(events))
    }

    /// Refetches the signed-in user's list from scratch.
    pub fn refresh(&self) -> ServiceResult<()> {
        self.send(ListCommand::Refresh, "refresh")
    }

    pub fn shutdown(&self) -> ServiceResult<()> {
        self.send(ListCommand::Shutdown, "shutdown")
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: ListCommand, stage: &'static str) -> ServiceResult<()> {
        self.commands
            .send(command)
            .map_err(|_| StoppedSnafu { stage }.build())
    }
}
