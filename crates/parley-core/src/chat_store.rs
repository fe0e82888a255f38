//! Chat content store: the durable, ordered conversation log.
//!
//! Independent of turn state: the orchestrator appends here from its event
//! handlers only. The log is append-only apart from the immediate-duplicate guard
//! on user messages; prompt shortening happens in the memory manager and never
//! touches this log.

use crate::error::CoreResult;
use crate::message::{ConversationMessage, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

/// Transcript preview shown before anything has been heard.
pub const DEFAULT_TRANSCRIPT_PREVIEW: &str = "";
/// Response line shown before the assistant has said anything.
pub const DEFAULT_CURRENT_RESPONSE: &str = "";

/// Serializable shape handed to (and accepted from) external storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSnapshot {
    #[serde(default, deserialize_with = "lenient_messages")]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub transcript_preview: String,
    #[serde(default)]
    pub current_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl ChatSnapshot {
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Storage written by older builds can hold entries we cannot parse; skip them
/// rather than dropping the whole conversation.
fn lenient_messages<'de, D>(deserializer: D) -> Result<Vec<ConversationMessage>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}

/// Owns the conversation transcript, the live transcript preview and the last response.
#[derive(Debug, Clone)]
pub struct ChatContentStore {
    messages: Vec<ConversationMessage>,
    transcript_preview: String,
    current_response: String,
}

impl Default for ChatContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatContentStore {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            transcript_preview: DEFAULT_TRANSCRIPT_PREVIEW.to_string(),
            current_response: DEFAULT_CURRENT_RESPONSE.to_string(),
        }
    }

    /// Append a user message unless it repeats the immediately preceding message.
    /// Returns whether the message was stored.
    pub fn append_user(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        if let Some(last) = self.messages.last() {
            if last.role == Role::User && last.content == text {
                debug!("dropping duplicate user message");
                return false;
            }
        }
        self.messages.push(ConversationMessage::user(text));
        true
    }

    /// Append an assistant message and remember it as the current response.
    pub fn append_assistant(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.current_response = text.clone();
        self.messages.push(ConversationMessage::assistant(text));
    }

    pub fn set_transcript_preview(&mut self, text: impl Into<String>) {
        self.transcript_preview = text.into();
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.transcript_preview = DEFAULT_TRANSCRIPT_PREVIEW.to_string();
        self.current_response = DEFAULT_CURRENT_RESPONSE.to_string();
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn transcript_preview(&self) -> &str {
        &self.transcript_preview
    }

    pub fn current_response(&self) -> &str {
        &self.current_response
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages.clone(),
            transcript_preview: self.transcript_preview.clone(),
            current_response: self.current_response.clone(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Replace the store contents with a snapshot. Restoring is the one path that
    /// bypasses the duplicate guard: the stored sequence is reproduced as-is.
    pub fn restore(&mut self, snapshot: ChatSnapshot) {
        self.messages = snapshot.messages;
        self.transcript_preview = snapshot.transcript_preview;
        self.current_response = if snapshot.current_response.is_empty() {
            self.messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(|m| m.content.clone())
                .unwrap_or_else(|| DEFAULT_CURRENT_RESPONSE.to_string())
        } else {
            snapshot.current_response
        };
    }

    pub fn from_snapshot(snapshot: ChatSnapshot) -> Self {
        let mut store = Self::new();
        store.restore(snapshot);
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_duplicate_user_message_is_dropped() {
        let mut store = ChatContentStore::new();
        assert!(store.append_user("turn on the lights"));
        assert!(!store.append_user("turn on the lights"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn duplicate_after_assistant_is_kept() {
        let mut store = ChatContentStore::new();
        store.append_user("again");
        store.append_assistant("ok");
        assert!(store.append_user("again"));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn assistant_append_updates_current_response() {
        let mut store = ChatContentStore::new();
        store.append_assistant("hello");
        assert_eq!(store.current_response(), "hello");
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = ChatContentStore::new();
        store.append_user("a");
        store.append_assistant("b");
        store.set_transcript_preview("partial");
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.transcript_preview(), DEFAULT_TRANSCRIPT_PREVIEW);
        assert_eq!(store.current_response(), DEFAULT_CURRENT_RESPONSE);
    }

    #[test]
    fn snapshot_round_trip_preserves_sequence() {
        let mut store = ChatContentStore::new();
        store.append_user("what's the weather");
        store.append_assistant("sunny");
        store.append_user("thanks");

        let json = store.snapshot().to_json().unwrap();
        let restored = ChatContentStore::from_snapshot(ChatSnapshot::from_json(&json).unwrap());
        assert_eq!(restored.messages(), store.messages());
        assert_eq!(restored.current_response(), "sunny");
    }

    #[test]
    fn restore_tolerates_missing_and_broken_fields() {
        let raw = r#"{"messages":[{"role":"user","content":"hi"},{"role":"robot","content":"?"},{"role":"assistant"}]}"#;
        let snapshot = ChatSnapshot::from_json(raw).unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.transcript_preview, "");

        let empty = ChatSnapshot::from_json("{}").unwrap();
        assert!(empty.messages.is_empty());
    }
}
