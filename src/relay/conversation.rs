//! Process-wide conversation history.
//!
//! Sessions take a [`HistorySnapshot`] when they start and hand back the completed
//! turn pair when they finish. A reset bumps the history epoch, so a completion that
//! was captured before the reset can never resurrect a turn afterwards.

use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Immutable view of the history at the moment a session started.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub epoch: u64,
    pub turns: Arc<[Turn]>,
}

impl HistorySnapshot {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[derive(Debug, Default)]
struct History {
    epoch: u64,
    turns: Vec<Turn>,
}

/// Shared, cloneable handle to the conversation history.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    inner: Arc<RwLock<History>>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current history, tagged with its epoch.
    pub fn snapshot(&self) -> HistorySnapshot {
        let history = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        HistorySnapshot {
            epoch: history.epoch,
            turns: history.turns.clone().into(),
        }
    }

    /// Append the turns of one completed exchange atomically.
    ///
    /// Returns `false` (and appends nothing) when the history was reset after
    /// `epoch` was captured.
    pub fn append(&self, epoch: u64, turns: impl IntoIterator<Item = Turn>) -> bool {
        let mut history = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if history.epoch != epoch {
            return false;
        }
        history.turns.extend(turns);
        true
    }

    /// Clear the history and start a new epoch.
    pub fn reset(&self) {
        let mut history = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        history.turns.clear();
        history.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let state = ConversationState::new();
        let snapshot = state.snapshot();
        assert!(state.append(snapshot.epoch, [Turn::user("hi"), Turn::assistant("hello")]));

        let before = snapshot;
        let after = state.snapshot();
        assert!(before.is_empty());
        assert_eq!(after.turns.len(), 2);

        state.reset();
        assert_eq!(after.turns.len(), 2);
        assert!(state.snapshot().is_empty());
    }

    #[test]
    fn test_append_after_reset_is_discarded() {
        let state = ConversationState::new();
        let stale = state.snapshot();
        state.reset();

        assert!(!state.append(stale.epoch, [Turn::user("ghost")]));
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let state = ConversationState::new();
        let epoch = state.snapshot().epoch;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                std::thread::spawn(move || {
                    state.append(epoch, [Turn::user(format!("q{i}")), Turn::assistant(format!("a{i}"))])
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }

        let turns = state.snapshot().turns;
        assert_eq!(turns.len(), 16);
        for pair in turns.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[0].content[1..], pair[1].content[1..]);
        }
    }
}
