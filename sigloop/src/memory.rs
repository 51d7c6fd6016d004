//! Session-scoped conversation memory.

use std::collections::BTreeSet;

use crate::ai::{ChatMessage, ChatResult, FunctionCall, Role};

/// Tag on corrective feedback turns.
pub const TAG_CORRECTION: &str = "correction";
/// Tag on assistant turns that failed validation.
pub const TAG_ERROR: &str = "error";
/// Tag on feedback produced by field processors.
pub const TAG_PROCESSOR: &str = "processor";

/// A message belonging to one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedMessage {
    /// Candidate index.
    pub index: usize,
    /// The message.
    pub message: ChatMessage,
}

/// One conversation entry.
///
/// System and user entries are shared by every candidate; assistant and
/// function entries hold one message per candidate (or per call).
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    /// Entry role.
    pub role: Role,
    /// Messages in this entry.
    pub messages: Vec<IndexedMessage>,
    /// Tags such as [`TAG_CORRECTION`].
    pub tags: BTreeSet<String>,
    /// Whether streamed partials may still update this entry.
    pub updatable: bool,
}

impl MemoryEntry {
    fn new(role: Role, messages: Vec<IndexedMessage>) -> Self {
        Self {
            role,
            messages,
            tags: BTreeSet::new(),
            updatable: false,
        }
    }

    /// Whether the entry carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// A tool result ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionResult {
    /// Candidate index the call came from.
    pub index: usize,
    /// Call id.
    pub function_id: String,
    /// Function name.
    pub name: String,
    /// Serialized result.
    pub result: String,
}

/// Append-only conversation store owned by one forward call.
pub trait Memory: Send + Sync {
    /// Records caller or feedback turns.
    fn add_request(&mut self, messages: Vec<ChatMessage>);

    /// Records complete model results as one assistant entry.
    fn add_results(&mut self, results: &[ChatResult]);

    /// Replaces the streamed partial for candidate `index`.
    ///
    /// Partials for one turn coalesce into a single updatable assistant entry.
    fn update_result(&mut self, index: usize, content: &str, function_calls: &[FunctionCall]);

    /// Records tool results, appending to a trailing function entry.
    fn add_function_results(&mut self, results: Vec<FunctionResult>);

    /// Tags the latest entry. A tagged entry no longer absorbs streamed updates.
    fn add_tag(&mut self, tag: &str);

    /// Removes every entry tagged `tag`.
    fn remove_by_tag(&mut self, tag: &str);

    /// The latest entry.
    fn get_last(&self) -> Option<&MemoryEntry>;

    /// The conversation as seen by candidate `index`.
    fn history(&self, index: usize) -> Vec<ChatMessage>;
}

/// In-process [`Memory`] backed by a vector.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    entries: Vec<MemoryEntry>,
}

impl ConversationMemory {
    /// Creates an empty memory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> &[MemoryEntry] {
        &self.entries
    }

    fn seal_last(&mut self) {
        if let Some(last) = self.entries.last_mut() {
            last.updatable = false;
        }
    }
}

impl Memory for ConversationMemory {
    fn add_request(&mut self, messages: Vec<ChatMessage>) {
        self.seal_last();
        for message in messages {
            let role = message.role();
            self.entries
                .push(MemoryEntry::new(role, vec![IndexedMessage { index: 0, message }]));
        }
    }

    fn add_results(&mut self, results: &[ChatResult]) {
        self.seal_last();
        let messages = results
            .iter()
            .map(|r| IndexedMessage {
                index: r.index,
                message: ChatMessage::Assistant {
                    content: r.content.clone(),
                    function_calls: r.function_calls.clone(),
                },
            })
            .collect();
        self.entries.push(MemoryEntry::new(Role::Assistant, messages));
    }

    fn update_result(&mut self, index: usize, content: &str, function_calls: &[FunctionCall]) {
        let message = ChatMessage::Assistant {
            content: (!content.is_empty()).then(|| content.to_string()),
            function_calls: function_calls.to_vec(),
        };

        match self.entries.last_mut() {
            Some(last) if last.updatable && last.role == Role::Assistant => {
                if let Some(slot) = last.messages.iter_mut().find(|m| m.index == index) {
                    slot.message = message;
                } else {
                    last.messages.push(IndexedMessage { index, message });
                }
            }
            _ => {
                let mut entry = MemoryEntry::new(Role::Assistant, vec![IndexedMessage { index, message }]);
                entry.updatable = true;
                self.entries.push(entry);
            }
        }
    }

    fn add_function_results(&mut self, results: Vec<FunctionResult>) {
        if results.is_empty() {
            return;
        }
        let messages: Vec<IndexedMessage> = results
            .into_iter()
            .map(|r| IndexedMessage {
                index: r.index,
                message: ChatMessage::Function {
                    function_id: r.function_id,
                    result: r.result,
                },
            })
            .collect();

        match self.entries.last_mut() {
            Some(last) if last.role == Role::Function => last.messages.extend(messages),
            _ => {
                self.seal_last();
                self.entries.push(MemoryEntry::new(Role::Function, messages));
            }
        }
    }

    fn add_tag(&mut self, tag: &str) {
        if let Some(last) = self.entries.last_mut() {
            last.tags.insert(tag.to_string());
            last.updatable = false;
        }
    }

    fn remove_by_tag(&mut self, tag: &str) {
        self.entries.retain(|e| !e.has_tag(tag));
    }

    fn get_last(&self) -> Option<&MemoryEntry> {
        self.entries.last()
    }

    fn history(&self, index: usize) -> Vec<ChatMessage> {
        self.entries
            .iter()
            .flat_map(|entry| {
                let shared = matches!(entry.role, Role::System | Role::User);
                entry
                    .messages
                    .iter()
                    .filter(move |m| shared || m.index == index)
                    .map(|m| m.message.clone())
            })
            .collect()
    }
}
