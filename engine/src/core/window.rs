//! Conversation history and the bounded window sent upstream.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: String,
}

/// One content part of a turn, in the chat-completions wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    /// PNG bytes as a base64 data URL.
    pub fn png(bytes: &[u8]) -> Self {
        Content::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:image/png;base64,{}", STANDARD.encode(bytes)),
                detail: "high".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: Vec<Content>,
}

impl Turn {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![Content::text(text)],
        }
    }

    pub fn user(content: Vec<Content>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![Content::text(text)],
        }
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                Content::Text { text } => Some(text.as_str()),
                Content::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Full history of one agent: the system turn plus alternating user/assistant turns.
///
/// [`ConversationState::payload`] only ever reads a suffix; the history itself is
/// trimmed solely by [`ConversationState::pop`] when a just-appended user turn is
/// withdrawn after an overflow.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    system: Option<Turn>,
    turns: Vec<Turn>,
}

impl ConversationState {
    /// Start a fresh conversation with the given system turn.
    pub fn begin(&mut self, system: Turn) {
        self.system = Some(system);
        self.turns.clear();
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn pop(&mut self) -> Option<Turn> {
        self.turns.pop()
    }

    pub fn system(&self) -> Option<&Turn> {
        self.system.as_ref()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// System turn plus the last `pairs` user/assistant pairs and the pending user turn.
    pub fn payload(&self, pairs: usize) -> Vec<Turn> {
        let keep = (pairs * 2 + 1).min(self.turns.len());
        self.system
            .iter()
            .chain(&self.turns[self.turns.len() - keep..])
            .cloned()
            .collect()
    }

    /// Every turn including the system turn, for logging.
    pub fn history(&self) -> Vec<Turn> {
        self.payload(self.turns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(rounds: usize) -> ConversationState {
        let mut state = ConversationState::default();
        state.begin(Turn::system("sys"));
        for i in 0..rounds {
            state.push(Turn::user(vec![Content::text(format!("u{i}"))]));
            state.push(Turn::assistant(format!("a{i}")));
        }
        state.push(Turn::user(vec![Content::text("pending")]));
        state
    }

    fn texts(turns: &[Turn]) -> Vec<String> {
        turns.iter().map(Turn::text).collect()
    }

    #[test]
    fn payload_keeps_system_and_recent_pairs() {
        let state = conversation(5);
        assert_eq!(
            texts(&state.payload(2)),
            vec!["sys", "u3", "a3", "u4", "a4", "pending"]
        );
    }

    #[test]
    fn zero_pairs_sends_only_pending_turn() {
        let state = conversation(5);
        assert_eq!(texts(&state.payload(0)), vec!["sys", "pending"]);
    }

    #[test]
    fn payload_is_not_destructive() {
        let state = conversation(4);
        let _ = state.payload(1);
        assert_eq!(state.turns().len(), 9);
        assert_eq!(state.history().len(), 10);
    }

    #[test]
    fn short_history_is_sent_whole() {
        let state = conversation(1);
        assert_eq!(texts(&state.payload(3)), vec!["sys", "u0", "a0", "pending"]);
    }

    #[test]
    fn begin_resets_turns() {
        let mut state = conversation(2);
        state.begin(Turn::system("next"));
        assert!(state.turns().is_empty());
        assert_eq!(texts(&state.payload(3)), vec!["next"]);
    }

    #[test]
    fn content_serializes_in_chat_shape() {
        let json = serde_json::to_value(Turn::user(vec![Content::text("hi"), Content::png(b"x")]))
            .expect("json");
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/png;base64,eA=="
        );
    }
}
