use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::frame::TurnId;
use crate::turn::Turn;

const TITLE_MAX_CHARS: usize = 48;
const PREVIEW_MAX_CHARS: usize = 80;

/// Configuration used to create a session (one conversation).
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Display name. When unset the first query becomes the title.
    pub name: Option<String>,
}

impl SessionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Sidebar entry describing a conversation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: uuid::Uuid,
    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// User and assistant messages, two per finished turn.
    pub message_count: usize,
    /// Start of the latest assistant answer.
    pub preview: Option<String>,
}

/// Finished turns of a session, oldest first, bounded to `limit`.
#[derive(Debug)]
pub(crate) struct SessionHistory {
    turns: VecDeque<Turn>,
    limit: usize,
}

impl SessionHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub(crate) fn push(&mut self, turn: Turn) {
        debug_assert!(turn.status().is_terminal());
        self.turns.push_back(turn);
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    pub(crate) fn find(&self, turn_id: &TurnId) -> Option<&Turn> {
        self.turns.iter().find(|t| t.turn_id() == turn_id)
    }

    pub(crate) fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.turns.clear();
    }

    pub(crate) fn summarize(&self, session_id: uuid::Uuid, config: &SessionConfig) -> SessionSummary {
        let title = config
            .name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.turns.front().map(|t| truncate(t.query(), TITLE_MAX_CHARS)))
            .unwrap_or_else(|| "New Chat".to_string());
        let preview = self
            .turns
            .iter()
            .rev()
            .find(|t| !t.text().trim().is_empty())
            .map(|t| truncate(t.text(), PREVIEW_MAX_CHARS));
        SessionSummary {
            session_id,
            title,
            created_at: self.turns.front().map(Turn::created_at),
            updated_at: self.turns.iter().map(Turn::updated_at).max(),
            message_count: self.turns.len() * 2,
            preview,
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
