//! Versioned cursor tokens.
//!
//! A cursor token is the opaque position marker a subscriber presents to
//! resume an incremental sync. It combines the owner's version token with
//! the sync mode of the payload it accompanied and a change-log position:
//! `"{version}:full:0"` or `"{version}:change:{after_index}"`.
//!
//! The version component ties a cursor to the identity of the data it was
//! minted against. Presenting a token whose version no longer matches the
//! owner's current version token degrades to a full-list sync — this is
//! the conflict-recovery path, never an error.

use serde::{Deserialize, Serialize};

/// Sync mode a cursor was minted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorKind {
    /// The accompanying payload was a full snapshot.
    FullList,
    /// The accompanying payload was a change-log diff.
    ChangeList,
}

/// A parsed cursor: sync mode plus change-log position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Sync mode of the payload this cursor accompanied.
    pub kind: CursorKind,
    /// Change-log index to resume after.
    pub after_index: u64,
}

impl SyncCursor {
    /// The cursor for a subscriber with no usable position.
    pub fn full() -> Self {
        Self {
            kind: CursorKind::FullList,
            after_index: 0,
        }
    }

    /// A full-snapshot cursor positioned at `after_index` for resumption.
    pub fn full_after(after_index: u64) -> Self {
        Self {
            kind: CursorKind::FullList,
            after_index,
        }
    }

    /// A change-list cursor positioned at `after_index`.
    pub fn changes_after(after_index: u64) -> Self {
        Self {
            kind: CursorKind::ChangeList,
            after_index,
        }
    }

    /// Renders the token string for this cursor under a version token.
    pub fn token(&self, version: &str) -> String {
        let kind = match self.kind {
            CursorKind::FullList => "full",
            CursorKind::ChangeList => "change",
        };
        format!("{version}:{kind}:{}", self.after_index)
    }

    /// Parses a token into its version component and cursor.
    pub fn parse(token: &str) -> Option<(String, SyncCursor)> {
        let mut parts = token.splitn(3, ':');
        let version = parts.next()?;
        if version.is_empty() {
            return None;
        }
        let kind = match parts.next()? {
            "full" => CursorKind::FullList,
            "change" => CursorKind::ChangeList,
            _ => return None,
        };
        let after_index = parts.next()?.parse().ok()?;
        Some((
            version.to_string(),
            SyncCursor { kind, after_index },
        ))
    }

    /// Resolves the cursor to serve a subscriber presenting `token`.
    ///
    /// An absent, unparseable, or version-mismatched token degrades to a
    /// full-list sync; a matching token resumes the change log after its
    /// recorded position regardless of the mode it was minted under.
    pub fn resume(token: &str, current_version: &str) -> SyncCursor {
        match Self::parse(token) {
            Some((version, cursor)) if version == current_version => {
                Self::changes_after(cursor.after_index)
            }
            _ => Self::full(),
        }
    }
}
