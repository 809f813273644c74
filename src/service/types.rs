// SPDX-License-Identifier: MPL-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a user (the current actor, a post author, a follow target).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

/// Identity of a post.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A post as the core sees it. Counters are snapshots from the last fetch,
/// adjusted locally by optimistic actions until the next refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
    pub likes_count: u32,
    pub shares_count: u32,
    pub replies_count: u32,
}

impl Post {
    pub fn counter_mut(&mut self, counter: Counter) -> &mut u32 {
        match counter {
            Counter::Likes => &mut self.likes_count,
            Counter::Shares => &mut self.shares_count,
        }
    }
}

/// Counters moved by the actor's own relationships. Reply counts only
/// change on refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Likes,
    Shares,
}

/// A relationship row the current actor can create or remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    Like,
    Share,
    Bookmark,
    Follow,
    Block,
}

impl RelationshipKind {
    /// Backing table in the data service
    pub fn table(self) -> Table {
        match self {
            Self::Like => Table::Likes,
            Self::Share => Table::Shares,
            Self::Bookmark => Table::Bookmarks,
            Self::Follow => Table::Follows,
            Self::Block => Table::Blocks,
        }
    }

    /// Column holding the acting user's id
    pub fn actor_column(self) -> &'static str {
        match self {
            Self::Like | Self::Share | Self::Bookmark => "user_id",
            Self::Follow => "follower_id",
            Self::Block => "blocker_id",
        }
    }

    /// Column holding the target's id
    pub fn target_column(self) -> &'static str {
        match self {
            Self::Like | Self::Share | Self::Bookmark => "post_id",
            Self::Follow => "following_id",
            Self::Block => "blocked_id",
        }
    }

    /// The post counter this relationship feeds, if any
    pub fn counter(self) -> Option<Counter> {
        match self {
            Self::Like => Some(Counter::Likes),
            Self::Share => Some(Counter::Shares),
            Self::Bookmark | Self::Follow | Self::Block => None,
        }
    }

    /// Whether the target is a user rather than a post
    pub fn targets_user(self) -> bool {
        matches!(self, Self::Follow | Self::Block)
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Like => "like",
            Self::Share => "share",
            Self::Bookmark => "bookmark",
            Self::Follow => "follow",
            Self::Block => "block",
        };
        f.write_str(name)
    }
}

/// Tables the client reads or watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Posts,
    Likes,
    Shares,
    Replies,
    Bookmarks,
    Follows,
    Blocks,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::Posts => "posts",
            Self::Likes => "likes",
            Self::Shares => "shares",
            Self::Replies => "replies",
            Self::Bookmarks => "bookmarks",
            Self::Follows => "follows",
            Self::Blocks => "blocks",
        }
    }
}

/// Query parameters for a post fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PostFilter {
    /// Only posts created at or after this instant
    pub window_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Delete,
}

/// A single relationship row that changed on the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipChange {
    pub kind: RelationshipKind,
    pub op: ChangeOp,
    pub actor: UserId,
    pub target: String,
}

/// Notification delivered to a subscription callback.
///
/// Polling backends only know that a table changed; push backends can
/// also say which row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    pub table: Table,
    pub relationship: Option<RelationshipChange>,
}

impl TableChange {
    pub fn coarse(table: Table) -> Self {
        Self {
            table,
            relationship: None,
        }
    }
}
