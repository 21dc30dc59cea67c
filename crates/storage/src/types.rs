use std::collections::HashSet;
use std::sync::Arc;

use super::identity::UserIdentity;
use super::ids::ConversationId;

/// Suffix appended to preview text cut at the configured length.
pub const PREVIEW_ELLIPSIS: char = '…';

/// Most recent message of a conversation, as seen by the viewing user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestMessagePreview {
    pub text: String,
    pub sent_at_unix_seconds: u64,
    /// Scoped to the viewer, so both participants may disagree.
    pub is_read: bool,
}

impl LatestMessagePreview {
    pub fn new(text: impl Into<String>, sent_at_unix_seconds: u64, is_read: bool) -> Self {
        Self {
            text: text.into(),
            sent_at_unix_seconds,
            is_read,
        }
    }

    /// Cuts `text` to at most `max_chars` characters, ellipsis included.
    pub fn truncated(mut self, max_chars: usize) -> Self {
        if max_chars == 0 || self.text.chars().count() <= max_chars {
            return self;
        }

        let mut shortened = self
            .text
            .chars()
            .take(max_chars.saturating_sub(1))
            .collect::<String>();
        shortened.truncate(shortened.trim_end().len());
        shortened.push(PREVIEW_ELLIPSIS);
        self.text = shortened;
        self
    }

    pub fn is_older_than(&self, other: &Self) -> bool {
        self.sent_at_unix_seconds < other.sent_at_unix_seconds
    }
}

/// One row of the conversation list from the viewer's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    /// Name of the other participant; may differ between the two sides.
    pub display_name: String,
    pub other_participant: UserIdentity,
    pub latest_message: LatestMessagePreview,
}

impl ConversationSummary {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        display_name: impl Into<String>,
        other_participant: UserIdentity,
        latest_message: LatestMessagePreview,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            display_name: display_name.into(),
            other_participant,
            latest_message,
        }
    }

    pub fn is_unread(&self) -> bool {
        !self.latest_message.is_read
    }

    /// `query` must already be trimmed and lower-cased.
    fn matches_query(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }

        self.display_name.to_lowercase().contains(query)
            || self.latest_message.text.to_lowercase().contains(query)
    }
}

/// Every conversation of one user at one point in time.
///
/// Immutable once built and cheap to clone; the next snapshot replaces it
/// wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationListSnapshot {
    owner: UserIdentity,
    conversations: Arc<[ConversationSummary]>,
}

impl ConversationListSnapshot {
    pub fn empty(owner: UserIdentity) -> Self {
        Self {
            owner,
            conversations: Arc::from(Vec::new()),
        }
    }

    /// Builds a snapshot, keeping the first occurrence of each conversation id.
    ///
    /// Returns the snapshot and the number of dropped duplicates.
    pub fn from_summaries(
        owner: UserIdentity,
        summaries: impl IntoIterator<Item = ConversationSummary>,
    ) -> (Self, usize) {
        let mut seen = HashSet::new();
        let mut dropped = 0;
        let mut conversations = Vec::new();

        for summary in summaries {
            if seen.insert(summary.conversation_id.clone()) {
                conversations.push(summary);
            } else {
                dropped += 1;
            }
        }

        (
            Self {
                owner,
                conversations: Arc::from(conversations),
            },
            dropped,
        )
    }

    pub fn owner(&self) -> &UserIdentity {
        &self.owner
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConversationSummary> {
        self.conversations.iter()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, conversation_id: &str) -> Option<&ConversationSummary> {
        self.conversations
            .iter()
            .find(|summary| summary.conversation_id.as_str() == conversation_id)
    }

    /// Case-insensitive match on display name or preview text, in list order.
    pub fn search(&self, query: &str) -> Vec<ConversationSummary> {
        let normalized_query = query.trim().to_lowercase();
        self.conversations
            .iter()
            .filter(|summary| summary.matches_query(&normalized_query))
            .cloned()
            .collect()
    }

    pub fn unread_count(&self) -> usize {
        self.conversations
            .iter()
            .filter(|summary| summary.is_unread())
            .count()
    }
}

impl<'a> IntoIterator for &'a ConversationListSnapshot {
    type Item = &'a ConversationSummary;
    type IntoIter = std::slice::Iter<'a, ConversationSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
