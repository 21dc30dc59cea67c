use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chitchat_storage::UserIdentity;
use tokio::sync::mpsc;

/// Authentication change pushed by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(UserIdentity),
    LoggedOut,
}

/// Identity provider as seen by the conversation list.
///
/// Consumers hold a [`SessionEvents`] for as long as they want notifications;
/// dropping it unregisters them.
pub trait SessionSource: Send + Sync {
    fn current_user(&self) -> Option<UserIdentity>;
    fn subscribe(&self) -> SessionEvents;
}

pub struct SessionEvents {
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionEvents {
    pub fn new(events: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { events }
    }

    /// `None` once the source is gone or the subscription was closed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.events.close();
    }
}

/// In-process session source driven by explicit `login`/`logout` calls.
#[derive(Debug, Clone, Default)]
pub struct LocalSessionSource {
    inner: Arc<Mutex<LocalSession>>,
}

#[derive(Debug, Default)]
struct LocalSession {
    current: Option<UserIdentity>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl LocalSessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with `identity` already signed in, as after an app relaunch.
    pub fn signed_in(identity: UserIdentity) -> Self {
        let source = Self::default();
        source.session().current = Some(identity);
        source
    }

    pub fn login(&self, identity: UserIdentity) {
        let mut session = self.session();
        session.current = Some(identity.clone());
        tracing::info!(identity = %identity, "session logged in");
        session.broadcast(SessionEvent::LoggedIn(identity));
    }

    pub fn logout(&self) {
        let mut session = self.session();
        if let Some(previous) = session.current.take() {
            tracing::info!(identity = %previous, "session logged out");
        }
        session.broadcast(SessionEvent::LoggedOut);
    }

    pub fn subscriber_count(&self) -> usize {
        let mut session = self.session();
        session.subscribers.retain(|sender| !sender.is_closed());
        session.subscribers.len()
    }

    fn session(&self) -> MutexGuard<'_, LocalSession> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LocalSession {
    fn broadcast(&mut self, event: SessionEvent) {
        self.subscribers
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl SessionSource for LocalSessionSource {
    fn current_user(&self) -> Option<UserIdentity> {
        self.session().current.clone()
    }

    fn subscribe(&self) -> SessionEvents {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.session().subscribers.push(sender);
        SessionEvents::new(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(raw: &str) -> UserIdentity {
        UserIdentity::parse(raw).expect("valid identity")
    }

    #[test]
    fn events_reach_every_live_subscriber_in_order() {
        let source = LocalSessionSource::new();
        let mut first = source.subscribe();
        let mut second = source.subscribe();

        source.login(identity("a@x.com"));
        source.logout();

        for events in [&mut first, &mut second] {
            assert_eq!(
                events.try_recv(),
                Some(SessionEvent::LoggedIn(identity("a@x.com")))
            );
            assert_eq!(events.try_recv(), Some(SessionEvent::LoggedOut));
            assert_eq!(events.try_recv(), None);
        }
        assert_eq!(source.current_user(), None);
    }

    #[test]
    fn dropped_subscribers_are_unregistered() {
        let source = LocalSessionSource::signed_in(identity("a@x.com"));
        let kept = source.subscribe();
        let dropped = source.subscribe();
        assert_eq!(source.subscriber_count(), 2);

        drop(dropped);
        source.logout();
        assert_eq!(source.subscriber_count(), 1);

        drop(kept);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn signed_in_source_reports_current_user_without_events() {
        let source = LocalSessionSource::signed_in(identity("A@x.com"));
        let mut events = source.subscribe();

        assert_eq!(source.current_user(), Some(identity("a@x.com")));
        assert_eq!(events.try_recv(), None);
    }
}
