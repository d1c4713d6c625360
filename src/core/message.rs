//! Ordered transcript of chat turns and its mutation primitives.
//!
//! The store replaces the whole transcript vector on every mutation and
//! hands out `Arc` snapshots, so consumers that memoize on pointer
//! equality see a new value exactly when something changed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn is_assistant(self) -> bool {
        self == Role::Assistant
    }
}

pub type MessageId = u64;

/// One transcript entry. Assistant entries are created as empty
/// streaming placeholders and mutated in place as chunks arrive;
/// everything else is immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ChatMessage {
    fn new(id: MessageId, role: Role, content: String, route: &Route) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            role,
            content,
            is_streaming: false,
            error: None,
            provider: Some(route.provider.id().to_string()),
            model: Some(route.model.clone()),
        }
    }

    /// A streaming assistant entry that has not produced content yet.
    pub fn is_open_placeholder(&self) -> bool {
        self.role.is_assistant() && self.is_streaming
    }
}

/// Append-only transcript with copy-on-write snapshots.
pub struct MessageStore {
    messages: Arc<Vec<ChatMessage>>,
    next_id: MessageId,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(Vec::new()),
            next_id: 1,
        }
    }

    /// Cheap clone of the current transcript. A new Arc is published on
    /// every mutation, never mutated behind one.
    pub fn snapshot(&self) -> Arc<Vec<ChatMessage>> {
        Arc::clone(&self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming).count()
    }

    fn edit(&mut self, mutate: impl FnOnce(&mut Vec<ChatMessage>)) {
        let mut next = (*self.messages).clone();
        mutate(&mut next);
        self.messages = Arc::new(next);
    }

    fn mint_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Append a user turn. Always appends; user turns are immutable
    /// once recorded.
    pub fn append_user(&mut self, text: &str, route: &Route) -> MessageId {
        let id = self.mint_id();
        let message = ChatMessage::new(id, Role::User, text.to_string(), route);
        self.edit(|messages| messages.push(message));
        id
    }

    /// Append an empty streaming assistant placeholder, or return the
    /// existing one if the last entry is still in flight. Duplicate UI
    /// triggers must not grow the transcript.
    pub fn append_assistant_placeholder(&mut self, route: &Route) -> MessageId {
        if let Some(last) = self.messages.last() {
            if last.is_open_placeholder() {
                return last.id;
            }
        }
        let id = self.mint_id();
        let mut message = ChatMessage::new(id, Role::Assistant, String::new(), route);
        message.is_streaming = true;
        self.edit(|messages| messages.push(message));
        id
    }

    /// Concatenate a chunk onto a streaming assistant entry. No-op for
    /// empty chunks, unknown ids, or non-assistant entries.
    pub fn merge_assistant_delta(&mut self, id: MessageId, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let applies = self
            .get(id)
            .map(|m| m.role.is_assistant())
            .unwrap_or(false);
        if !applies {
            return;
        }
        self.edit(|messages| {
            if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
                message.content.push_str(chunk);
            }
        });
    }

    pub fn finalize_assistant(&mut self, id: MessageId) {
        self.close_assistant(id, None);
    }

    pub fn set_error_on_assistant(&mut self, id: MessageId, error: &str) {
        self.close_assistant(id, Some(error));
    }

    fn close_assistant(&mut self, id: MessageId, error: Option<&str>) {
        let applies = self
            .get(id)
            .map(|m| m.role.is_assistant())
            .unwrap_or(false);
        if !applies {
            return;
        }
        let error = error.map(str::to_string);
        self.edit(|messages| {
            if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
                message.is_streaming = false;
                message.error = error;
            }
        });
    }

    /// Recovery path: close out the most recent streaming assistant
    /// entry when the originating id is unknown (forced cleanup after a
    /// cancel or teardown). No-op when nothing is streaming.
    pub fn finalize_latest_streaming_assistant(&mut self, error: Option<&str>) {
        let target = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role.is_assistant() && m.is_streaming)
            .map(|m| m.id);
        if let Some(id) = target {
            self.close_assistant(id, error);
        }
    }

    /// Drop a trailing assistant entry (used by the retry path before
    /// re-streaming the last user prompt).
    pub fn remove_trailing_assistant(&mut self) {
        if self
            .messages
            .last()
            .map(|m| m.role.is_assistant())
            .unwrap_or(false)
        {
            self.edit(|messages| {
                messages.pop();
            });
        }
    }

    pub fn clear_all(&mut self) {
        self.messages = Arc::new(Vec::new());
    }

    /// Replace the transcript with persisted history. Ids keep their
    /// stored values; the mint counter moves past the highest one.
    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        self.next_id = messages.iter().map(|m| m.id + 1).max().unwrap_or(1);
        self.messages = Arc::new(messages);
    }
}
