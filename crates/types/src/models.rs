//! Table models persisted by the moderation groups

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TypesError};

/// Replacement written over banned words
pub const MASK: &str = "****";

/// Per-receiver set of blocked senders.
///
/// Kept as a list to stay wire compatible with existing tables; `block`
/// refuses duplicates so replaying a block command is a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockList {
    #[serde(rename = "blocked_users", default)]
    pub users: Vec<i64>,
}

impl BlockList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user to the list.
    ///
    /// Returns `false` if the user was already blocked.
    pub fn block(&mut self, user_id: i64) -> bool {
        if self.is_blocked(user_id) {
            return false;
        }
        self.users.push(user_id);
        true
    }

    pub fn is_blocked(&self, user_id: i64) -> bool {
        self.users.contains(&user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl FromIterator<i64> for BlockList {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        let mut list = BlockList::new();
        for id in iter {
            list.block(id);
        }
        list
    }
}

/// Canonical form of a banned word: trimmed and lower-cased.
///
/// Fails on empty input or input containing whitespace, since message
/// tokens never contain whitespace and such a word could never match.
pub fn normalize_word(raw: &str) -> Result<String> {
    let word = raw.trim();
    if word.is_empty() || word.chars().any(char::is_whitespace) {
        return Err(TypesError::InvalidWord(raw.to_string()));
    }
    Ok(word.to_lowercase())
}
