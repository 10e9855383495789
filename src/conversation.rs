use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    fn as_api_role(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::now(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::now(TurnRole::Assistant, content)
    }

    fn now(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only turn log that keeps at most `max_turns` entries, evicting the oldest first.
#[derive(Debug, Clone)]
pub struct ConversationState {
    turns: VecDeque<ConversationTurn>,
    max_turns: usize,
    conversation_id: Option<String>,
}

impl ConversationState {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(max_turns.saturating_add(1)),
            max_turns,
            conversation_id: None,
        }
    }

    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// The `n` most recent turns, oldest first.
    pub fn window(&self, n: usize) -> Vec<ConversationTurn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    /// `conversation_history` field value: a JSON array of `{role, content}`.
    pub fn history_json(&self, n: usize) -> Value {
        Value::Array(
            self.window(n)
                .iter()
                .map(|turn| {
                    json!({
                        "role": turn.role.as_api_role(),
                        "content": turn.content,
                    })
                })
                .collect(),
        )
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.conversation_id = None;
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn set_conversation_id(&mut self, id: Option<String>) {
        if id.is_some() {
            self.conversation_id = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(state: &mut ConversationState, count: usize) {
        for index in 1..=count {
            let turn = if index % 2 == 1 {
                ConversationTurn::user(format!("turn {index}"))
            } else {
                ConversationTurn::assistant(format!("turn {index}"))
            };
            state.append(turn);
        }
    }

    #[test]
    fn eviction_keeps_the_most_recent_turns_in_order() {
        let mut state = ConversationState::new(20);
        numbered(&mut state, 25);
        assert_eq!(state.len(), 20);
        let contents: Vec<String> = state.window(20).into_iter().map(|t| t.content).collect();
        let expected: Vec<String> = (6..=25).map(|i| format!("turn {i}")).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn length_never_exceeds_bound() {
        let mut state = ConversationState::new(3);
        for count in 0..10 {
            state.append(ConversationTurn::user(count.to_string()));
            assert!(state.len() <= 3);
        }
    }

    #[test]
    fn window_is_a_pure_read() {
        let mut state = ConversationState::new(20);
        numbered(&mut state, 7);
        let first = state.window(4);
        let second = state.window(4);
        assert_eq!(first, second);
        assert_eq!(first[0].content, "turn 4");
        assert_eq!(state.len(), 7);
        assert_eq!(state.window(100).len(), 7);
        assert!(state.window(0).is_empty());
    }

    #[test]
    fn history_json_uses_api_roles() {
        let mut state = ConversationState::new(20);
        state.append(ConversationTurn::user("is it too dry to sow?"));
        state.append(ConversationTurn::assistant("wait for rain"));
        let history = state.history_json(10);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[1]["role"], "assistant");
        assert_eq!(history[1]["content"], "wait for rain");
    }

    #[test]
    fn clear_resets_turns_and_identity() {
        let mut state = ConversationState::new(20);
        numbered(&mut state, 3);
        state.set_conversation_id(Some("abc".into()));
        state.set_conversation_id(None);
        assert_eq!(state.conversation_id(), Some("abc"));
        state.clear();
        assert!(state.is_empty());
        assert_eq!(state.conversation_id(), None);
    }
}
