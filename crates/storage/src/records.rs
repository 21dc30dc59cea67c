//! Remote schema of the conversation tree and its decoding into snapshots.
//!
//! ```text
//! <identity key>
//! └── conversations: [
//!       { "id", "name", "other_user_email",
//!         "latest_message": { "date", "message", "is_read" } },
//!       ...
//!     ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;

use super::error::{DecodeSnafu, InvalidRecordSnafu, NotFoundSnafu, StoreResult};
use super::identity::UserIdentity;
use super::types::{ConversationListSnapshot, ConversationSummary, LatestMessagePreview};

pub const CONVERSATIONS_FIELD: &str = "conversations";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLatestMessage {
    /// Unix seconds.
    pub date: u64,
    pub message: String,
    pub is_read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConversationRecord {
    pub id: String,
    pub name: String,
    pub other_user_email: String,
    pub latest_message: RemoteLatestMessage,
}

/// Path of the node holding every conversation of `identity`.
pub fn user_node_path(identity: &UserIdentity) -> String {
    identity.as_key().to_string()
}

pub(crate) struct DecodedConversations {
    pub summaries: Vec<ConversationSummary>,
}

/// Decodes the user node read at [`user_node_path`].
///
/// `None` means the identity does not exist in the store. A present node with
/// no conversations decodes to an empty list.
pub(crate) fn decode_user_node(
    identity: &UserIdentity,
    node: Option<&Value>,
    preview_max_chars: usize,
) -> StoreResult<DecodedConversations> {
    let Some(node) = node else {
        return NotFoundSnafu {
            stage: "decode-user-node",
            identity: identity.as_key().to_string(),
        }
        .fail();
    };

    let base_path = user_node_path(identity);
    let conversations = match node {
        Value::Null => None,
        Value::Object(fields) => fields.get(CONVERSATIONS_FIELD),
        _ => {
            return InvalidRecordSnafu {
                stage: "decode-user-node-shape",
                path: base_path,
                details: "user node is not an object".to_string(),
            }
            .fail();
        }
    };

    let records = match conversations {
        None | Some(Value::Null) => &[][..],
        Some(Value::Array(records)) => records.as_slice(),
        Some(_) => {
            return InvalidRecordSnafu {
                stage: "decode-conversations-shape",
                path: format!("{base_path}/{CONVERSATIONS_FIELD}"),
                details: "conversations is not an array".to_string(),
            }
            .fail();
        }
    };

    let mut summaries = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        // Sparse arrays come back with null holes where entries were removed.
        if record.is_null() {
            continue;
        }

        let path = format!("{base_path}/{CONVERSATIONS_FIELD}/{index}");
        summaries.push(decode_record(record, &path, preview_max_chars)?);
    }

    Ok(DecodedConversations { summaries })
}

fn decode_record(
    record: &Value,
    path: &str,
    preview_max_chars: usize,
) -> StoreResult<ConversationSummary> {
    let record = RemoteConversationRecord::deserialize(record).context(DecodeSnafu {
        stage: "decode-conversation-record",
        path: path.to_string(),
    })?;

    if record.id.trim().is_empty() {
        return InvalidRecordSnafu {
            stage: "decode-conversation-id",
            path: path.to_string(),
            details: "conversation id is empty".to_string(),
        }
        .fail();
    }

    let other_participant = UserIdentity::parse(&record.other_user_email).map_err(|source| {
        InvalidRecordSnafu {
            stage: "decode-other-participant",
            path: path.to_string(),
            details: source.to_string(),
        }
        .build()
    })?;

    let latest_message = LatestMessagePreview::new(
        record.latest_message.message,
        record.latest_message.date,
        record.latest_message.is_read,
    )
    .truncated(preview_max_chars);

    Ok(ConversationSummary::new(
        record.id,
        record.name,
        other_participant,
        latest_message,
    ))
}

impl DecodedConversations {
    pub fn into_snapshot(self, owner: UserIdentity) -> (ConversationListSnapshot, usize) {
        ConversationListSnapshot::from_summaries(owner, self.summaries)
    }
}
