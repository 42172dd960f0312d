//! Bounded per-user conversation memory.
//!
//! Kept only in process memory. Bounded two ways: a turn count and a cheap
//! token estimate (whitespace split); the oldest turns are evicted first.
//! The estimate is intentionally rough — it only has to keep the next
//! prompt under the agent's context window.

use tracing::warn;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug)]
pub struct ConversationHistory {
    turns: VecDeque<ChatTurn>,
    max_turns: usize,
    max_tokens: usize,
    warning_ratio: f64,
    warned: bool,
}

impl ConversationHistory {
    pub fn new(max_turns: usize, max_tokens: usize, warning_ratio: f64) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns,
            max_tokens,
            warning_ratio,
            warned: false,
        }
    }

    /// Append a turn, evicting from the front until both bounds hold.
    pub fn push(&mut self, role: ChatRole, content: impl Into<String>) {
        self.turns.push_back(ChatTurn {
            role,
            content: content.into(),
        });

        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
        while self.estimated_tokens() > self.max_tokens && self.turns.len() > 1 {
            self.turns.pop_front();
        }

        let used = self.estimated_tokens();
        let threshold = (self.max_tokens as f64 * self.warning_ratio) as usize;
        if used >= threshold && !self.warned {
            self.warned = true;
            warn!(
                used,
                limit = self.max_tokens,
                "Conversation history approaching token limit"
            );
        } else if used < threshold {
            self.warned = false;
        }
    }

    /// Whitespace-token estimate across all retained turns.
    pub fn estimated_tokens(&self) -> usize {
        self.turns
            .iter()
            .map(|t| t.content.split_whitespace().count())
            .sum()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last_turn(&self) -> Option<&ChatTurn> {
        self.turns.back()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.warned = false;
    }
}
