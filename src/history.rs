//! Per-session conversation log
//!
//! Keeps the user/bot exchange with timestamps so a session can be
//! inspected after the fact. Bounded; oldest turns fall off first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const DEFAULT_CAPACITY: usize = 200;

/// Who produced a logged turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Bot,
}

/// A single logged turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub timestamp: DateTime<Utc>,
    pub role: TurnRole,
    pub content: String,
}

impl TurnRecord {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content: content.into(),
        }
    }
}

/// Bounded conversation log for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationLog {
    turns: VecDeque<TurnRecord>,
    capacity: usize,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, role: TurnRole, content: impl Into<String>) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(TurnRecord::new(role, content));
    }

    pub fn turns(&self) -> impl Iterator<Item = &TurnRecord> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new()
    }
}
