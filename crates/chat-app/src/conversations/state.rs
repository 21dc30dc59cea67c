use chitchat_storage::{ConversationListSnapshot, ConversationSummary, UserIdentity};

/// Identifies one fetch/update subscription.
///
/// Minted fresh on every login or refresh so results of a superseded
/// subscription can be recognized and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(pub u64);

impl SubscriptionToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// What the conversation screen should show.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ViewState {
    /// Nothing is known yet for the current session.
    #[default]
    Loading,
    /// Signed out, failed, or the user has no conversations.
    Empty,
    Populated(ConversationListSnapshot),
}

impl ViewState {
    /// Empty snapshots collapse to [`ViewState::Empty`].
    pub fn from_snapshot(snapshot: ConversationListSnapshot) -> Self {
        if snapshot.is_empty() {
            Self::Empty
        } else {
            Self::Populated(snapshot)
        }
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        match self {
            Self::Populated(snapshot) => snapshot.conversations(),
            Self::Loading | Self::Empty => &[],
        }
    }

    pub fn snapshot(&self) -> Option<&ConversationListSnapshot> {
        match self {
            Self::Populated(snapshot) => Some(snapshot),
            Self::Loading | Self::Empty => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Subscription lifecycle of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Unauthenticated,
    Subscribing {
        identity: UserIdentity,
        token: SubscriptionToken,
    },
    Subscribed {
        identity: UserIdentity,
        token: SubscriptionToken,
    },
}

impl SyncPhase {
    pub fn active_token(&self) -> Option<SubscriptionToken> {
        match self {
            Self::Subscribing { token, .. } | Self::Subscribed { token, .. } => Some(*token),
            Self::Unauthenticated => None,
        }
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        match self {
            Self::Subscribing { identity, .. } | Self::Subscribed { identity, .. } => {
                Some(identity)
            }
            Self::Unauthenticated => None,
        }
    }

    /// Returns true when a result tagged with `token` may still change state.
    pub fn accepts(&self, token: SubscriptionToken) -> bool {
        self.active_token() == Some(token)
    }
}

/// Input to [`SyncState::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTransition {
    Login {
        identity: UserIdentity,
        token: SubscriptionToken,
    },
    FetchSucceeded {
        token: SubscriptionToken,
        snapshot: ConversationListSnapshot,
    },
    FetchFailed {
        token: SubscriptionToken,
    },
    SnapshotUpdated {
        token: SubscriptionToken,
        snapshot: ConversationListSnapshot,
    },
    UpdateFailed {
        token: SubscriptionToken,
    },
    Logout,
}

/// Why a transition was refused. State is left untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTransitionRejection {
    StaleToken {
        active: Option<SubscriptionToken>,
        attempted: SubscriptionToken,
    },
    TokenNotAdvanced {
        latest: SubscriptionToken,
        attempted: SubscriptionToken,
    },
    NotSubscribing {
        token: SubscriptionToken,
    },
    NotSubscribed {
        token: SubscriptionToken,
    },
    OwnerMismatch {
        expected: UserIdentity,
        actual: UserIdentity,
    },
}

pub type SyncTransitionResult = Result<SyncState, SyncTransitionRejection>;

/// Phase plus derived view, changed only through [`SyncState::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncState {
    phase: SyncPhase,
    view: ViewState,
    latest_token: Option<SubscriptionToken>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &SyncPhase {
        &self.phase
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn latest_token(&self) -> Option<SubscriptionToken> {
        self.latest_token
    }

    /// Computes the next state without mutating `self`.
    ///
    /// Results must carry the active token. Logging out is accepted in every
    /// phase and always lands on an empty view.
    pub fn apply(&self, transition: SyncTransition) -> SyncTransitionResult {
        match transition {
            SyncTransition::Login { identity, token } => self.apply_login(identity, token),
            SyncTransition::FetchSucceeded { token, snapshot } => {
                self.apply_fetch_succeeded(token, snapshot)
            }
            SyncTransition::FetchFailed { token } => self.apply_fetch_failed(token),
            SyncTransition::SnapshotUpdated { token, snapshot } => {
                self.apply_snapshot_updated(token, snapshot)
            }
            SyncTransition::UpdateFailed { token } => self.apply_update_failed(token),
            SyncTransition::Logout => Ok(Self {
                phase: SyncPhase::Unauthenticated,
                view: ViewState::Empty,
                latest_token: self.latest_token,
            }),
        }
    }

    fn apply_login(&self, identity: UserIdentity, token: SubscriptionToken) -> SyncTransitionResult {
        if let Some(latest) = self.latest_token
            && token <= latest
        {
            return Err(SyncTransitionRejection::TokenNotAdvanced {
                latest,
                attempted: token,
            });
        }

        Ok(Self {
            phase: SyncPhase::Subscribing { identity, token },
            view: ViewState::Loading,
            latest_token: Some(token),
        })
    }

    fn apply_fetch_succeeded(
        &self,
        token: SubscriptionToken,
        snapshot: ConversationListSnapshot,
    ) -> SyncTransitionResult {
        self.ensure_active(token)?;
        match &self.phase {
            SyncPhase::Subscribing { identity, .. } => {
                ensure_owner(identity, &snapshot)?;
                Ok(Self {
                    phase: SyncPhase::Subscribed {
                        identity: identity.clone(),
                        token,
                    },
                    view: ViewState::from_snapshot(snapshot),
                    latest_token: self.latest_token,
                })
            }
            SyncPhase::Subscribed { .. } | SyncPhase::Unauthenticated => {
                Err(SyncTransitionRejection::NotSubscribing { token })
            }
        }
    }

    fn apply_fetch_failed(&self, token: SubscriptionToken) -> SyncTransitionResult {
        self.ensure_active(token)?;
        match &self.phase {
            SyncPhase::Subscribing { .. } => Ok(Self {
                phase: SyncPhase::Unauthenticated,
                view: ViewState::Empty,
                latest_token: self.latest_token,
            }),
            SyncPhase::Subscribed { .. } | SyncPhase::Unauthenticated => {
                Err(SyncTransitionRejection::NotSubscribing { token })
            }
        }
    }

    fn apply_snapshot_updated(
        &self,
        token: SubscriptionToken,
        snapshot: ConversationListSnapshot,
    ) -> SyncTransitionResult {
        self.ensure_active(token)?;
        match &self.phase {
            SyncPhase::Subscribed { identity, .. } => {
                ensure_owner(identity, &snapshot)?;
                Ok(Self {
                    phase: self.phase.clone(),
                    view: ViewState::from_snapshot(snapshot),
                    latest_token: self.latest_token,
                })
            }
            SyncPhase::Subscribing { .. } | SyncPhase::Unauthenticated => {
                Err(SyncTransitionRejection::NotSubscribed { token })
            }
        }
    }

    fn apply_update_failed(&self, token: SubscriptionToken) -> SyncTransitionResult {
        self.ensure_active(token)?;
        match &self.phase {
            SyncPhase::Subscribed { .. } => Ok(Self {
                phase: self.phase.clone(),
                view: ViewState::Empty,
                latest_token: self.latest_token,
            }),
            SyncPhase::Subscribing { .. } | SyncPhase::Unauthenticated => {
                Err(SyncTransitionRejection::NotSubscribed { token })
            }
        }
    }

    fn ensure_active(&self, token: SubscriptionToken) -> Result<(), SyncTransitionRejection> {
        if self.phase.accepts(token) {
            Ok(())
        } else {
            Err(SyncTransitionRejection::StaleToken {
                active: self.phase.active_token(),
                attempted: token,
            })
        }
    }
}

fn ensure_owner(
    identity: &UserIdentity,
    snapshot: &ConversationListSnapshot,
) -> Result<(), SyncTransitionRejection> {
    if snapshot.owner() == identity {
        Ok(())
    } else {
        Err(SyncTransitionRejection::OwnerMismatch {
            expected: identity.clone(),
            actual: snapshot.owner().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use chitchat_storage::LatestMessagePreview;

    use super::*;

    fn identity(raw: &str) -> UserIdentity {
        UserIdentity::parse(raw).expect("valid identity")
    }

    fn snapshot(owner: &str, ids: &[&str]) -> ConversationListSnapshot {
        let summaries = ids.iter().map(|id| {
            ConversationSummary::new(
                *id,
                format!("peer {id}"),
                identity(&format!("{id}@peer.org")),
                LatestMessagePreview::new("Hello World", 1, false),
            )
        });
        ConversationListSnapshot::from_summaries(identity(owner), summaries).0
    }

    fn logged_in(owner: &str, token: u64) -> SyncState {
        SyncState::new()
            .apply(SyncTransition::Login {
                identity: identity(owner),
                token: SubscriptionToken::new(token),
            })
            .expect("login accepted")
    }

    #[test]
    fn initial_state_is_unauthenticated_and_loading() {
        let state = SyncState::new();
        assert_eq!(state.phase(), &SyncPhase::Unauthenticated);
        assert!(state.view().is_loading());
        assert_eq!(state.latest_token(), None);
    }

    #[test]
    fn successful_fetch_populates_in_snapshot_order() {
        let state = logged_in("a@x.com", 1)
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c3", "c1", "c2"]),
            })
            .expect("fetch accepted");

        assert!(matches!(state.phase(), SyncPhase::Subscribed { .. }));
        let ids = state
            .view()
            .conversations()
            .iter()
            .map(|summary| summary.conversation_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["c3", "c1", "c2"]);
    }

    #[test]
    fn empty_fetch_maps_to_empty_view() {
        let state = logged_in("a@x.com", 1)
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &[]),
            })
            .expect("fetch accepted");

        assert_eq!(state.view(), &ViewState::Empty);
        assert!(matches!(state.phase(), SyncPhase::Subscribed { .. }));
    }

    #[test]
    fn failed_fetch_returns_to_unauthenticated_with_empty_view() {
        let state = logged_in("a@x.com", 1)
            .apply(SyncTransition::FetchFailed {
                token: SubscriptionToken::new(1),
            })
            .expect("failure accepted");

        assert_eq!(state.phase(), &SyncPhase::Unauthenticated);
        assert_eq!(state.view(), &ViewState::Empty);
    }

    #[test]
    fn superseded_results_are_rejected_as_stale() {
        let relogged = logged_in("a@x.com", 1)
            .apply(SyncTransition::Login {
                identity: identity("b@y.com"),
                token: SubscriptionToken::new(2),
            })
            .expect("relogin accepted");

        let rejection = relogged
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c1"]),
            })
            .expect_err("stale result rejected");

        assert_eq!(
            rejection,
            SyncTransitionRejection::StaleToken {
                active: Some(SubscriptionToken::new(2)),
                attempted: SubscriptionToken::new(1),
            }
        );
    }

    #[test]
    fn login_tokens_must_increase_even_after_logout() {
        let logged_out = logged_in("a@x.com", 5)
            .apply(SyncTransition::Logout)
            .expect("logout accepted");

        let rejection = logged_out
            .apply(SyncTransition::Login {
                identity: identity("a@x.com"),
                token: SubscriptionToken::new(5),
            })
            .expect_err("reused token rejected");
        assert!(matches!(
            rejection,
            SyncTransitionRejection::TokenNotAdvanced { .. }
        ));
    }

    #[test]
    fn logout_is_accepted_from_every_phase() {
        let subscribing = logged_in("a@x.com", 1);
        let subscribed = subscribing
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c1"]),
            })
            .expect("fetch accepted");

        for state in [SyncState::new(), subscribing, subscribed] {
            let next = state.apply(SyncTransition::Logout).expect("logout accepted");
            assert_eq!(next.phase(), &SyncPhase::Unauthenticated);
            assert_eq!(next.view(), &ViewState::Empty);
            assert!(!next.phase().accepts(SubscriptionToken::new(1)));
        }
    }

    #[test]
    fn updates_require_an_established_subscription() {
        let subscribing = logged_in("a@x.com", 1);
        let rejection = subscribing
            .apply(SyncTransition::SnapshotUpdated {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c1"]),
            })
            .expect_err("update before fetch rejected");
        assert_eq!(
            rejection,
            SyncTransitionRejection::NotSubscribed {
                token: SubscriptionToken::new(1)
            }
        );
    }

    #[test]
    fn update_failure_empties_view_but_keeps_subscription() {
        let subscribed = logged_in("a@x.com", 1)
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c1"]),
            })
            .expect("fetch accepted");

        let failed = subscribed
            .apply(SyncTransition::UpdateFailed {
                token: SubscriptionToken::new(1),
            })
            .expect("update failure accepted");
        assert_eq!(failed.view(), &ViewState::Empty);
        assert!(failed.phase().accepts(SubscriptionToken::new(1)));

        let recovered = failed
            .apply(SyncTransition::SnapshotUpdated {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c1", "c2"]),
            })
            .expect("later update accepted");
        assert_eq!(recovered.view().conversations().len(), 2);
    }

    #[test]
    fn snapshots_for_another_identity_are_refused() {
        let rejection = logged_in("a@x.com", 1)
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("b@y.com", &["c9"]),
            })
            .expect_err("foreign snapshot rejected");

        assert!(matches!(
            rejection,
            SyncTransitionRejection::OwnerMismatch { .. }
        ));
    }

    #[test]
    fn duplicate_fetch_completion_is_rejected() {
        let subscribed = logged_in("a@x.com", 1)
            .apply(SyncTransition::FetchSucceeded {
                token: SubscriptionToken::new(1),
                snapshot: snapshot("a@x.com", &["c1"]),
            })
            .expect("fetch accepted");

        let rejection = subscribed
            .apply(SyncTransition::FetchFailed {
                token: SubscriptionToken::new(1),
            })
            .expect_err("second completion rejected");
        assert_eq!(
            rejection,
            SyncTransitionRejection::NotSubscribing {
                token: SubscriptionToken::new(1)
            }
        );
    }
}
