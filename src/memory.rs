use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Agent,
}

/// A message in the conversation history sent to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn human(content: impl Into<String>) -> Self {
        Self {
            role: Role::Human,
            content: content.into(),
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            content: content.into(),
        }
    }
}

/// Bounded FIFO of turns; pushing past the bound evicts the oldest.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    bound: usize,
}

impl ConversationHistory {
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            turns: VecDeque::with_capacity(bound),
            bound,
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.bound {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn to_vec(&self) -> Vec<ConversationTurn> {
        self.turns.iter().cloned().collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.turns)?;
        Ok(())
    }

    /// Loads saved turns, keeping only the newest `bound` of them.
    /// A missing file yields an empty history.
    pub fn load(path: &Path, bound: usize) -> Result<Self> {
        let mut history = Self::new(bound);
        if !path.exists() {
            return Ok(history);
        }
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let saved: Vec<ConversationTurn> = serde_json::from_reader(reader)?;
        tracing::debug!(turns = saved.len(), path = %path.display(), "loaded conversation memory");
        for turn in saved {
            history.push(turn);
        }
        Ok(history)
    }
}
