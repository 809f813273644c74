// SPDX-License-Identifier: MPL-2.0

//! Trending: engagement scoring over a recent time window.
//!
//! Ranking is a pure function of the candidate posts, the window and the
//! current time. It is recomputed in full on every refresh or window change.

use crate::config::TRENDING_LIMIT;
use crate::service::Post;
use crate::state::MembershipSet;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Points per interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngagementWeights {
    pub like: u64,
    pub reply: u64,
    pub share: u64,
}

pub const ENGAGEMENT_WEIGHTS: EngagementWeights = EngagementWeights {
    like: 3,
    reply: 2,
    share: 5,
};

impl EngagementWeights {
    pub fn score(&self, post: &Post) -> u64 {
        u64::from(post.likes_count) * self.like
            + u64::from(post.replies_count) * self.reply
            + u64::from(post.shares_count) * self.share
    }
}

/// How far back trending looks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendingWindow {
    Day,
    #[default]
    Week,
    Month,
}

impl TrendingWindow {
    pub const ALL: [TrendingWindow; 3] = [Self::Day, Self::Week, Self::Month];

    pub fn days(self) -> i64 {
        match self {
            Self::Day => 1,
            Self::Week => 7,
            Self::Month => 30,
        }
    }

    pub fn from_days(days: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.days() == days)
    }

    /// Oldest `created_at` that still qualifies at `now`
    pub fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.days())
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Day => "Today",
            Self::Week => "This week",
            Self::Month => "This month",
        }
    }
}

/// A post with the score it was ranked by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedPost {
    pub post: Post,
    pub engagement_score: u64,
}

impl RankedPost {
    pub fn new(post: Post) -> Self {
        let engagement_score = ENGAGEMENT_WEIGHTS.score(&post);
        Self {
            post,
            engagement_score,
        }
    }

    /// Recompute the score after a counter changed. Does not reorder.
    pub fn rescore(&mut self) {
        self.engagement_score = ENGAGEMENT_WEIGHTS.score(&self.post);
    }
}

/// Top posts inside `window`, highest engagement first.
///
/// Equal scores go newest first; posts that also share `created_at` keep
/// their input order.
pub fn rank(posts: &[Post], window: TrendingWindow, now: DateTime<Utc>) -> Vec<RankedPost> {
    let start = window.start(now);

    let mut ranked: Vec<RankedPost> = posts
        .iter()
        .filter(|p| p.created_at >= start)
        .cloned()
        .map(RankedPost::new)
        .collect();

    ranked.sort_by(|a, b| {
        b.engagement_score
            .cmp(&a.engagement_score)
            .then_with(|| b.post.created_at.cmp(&a.post.created_at))
    });
    ranked.truncate(TRENDING_LIMIT);
    ranked
}

/// Last ranked list shown by the trending view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrendingBoard {
    window: TrendingWindow,
    entries: Vec<RankedPost>,
    ranked_at: Option<DateTime<Utc>>,
}

impl TrendingBoard {
    pub fn new(window: TrendingWindow) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    pub fn window(&self) -> TrendingWindow {
        self.window
    }

    pub fn entries(&self) -> &[RankedPost] {
        &self.entries
    }

    pub fn ranked_at(&self) -> Option<DateTime<Utc>> {
        self.ranked_at
    }

    /// Replace the list with a fresh ranking of `candidates`
    pub fn rerank(&mut self, window: TrendingWindow, candidates: &[Post], now: DateTime<Utc>) {
        self.window = window;
        self.entries = rank(candidates, window, now);
        self.ranked_at = Some(now);
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [RankedPost] {
        &mut self.entries
    }

    /// Drop entries by authors the actor has blocked
    pub(crate) fn hide_authors(&mut self, blocked: &MembershipSet) {
        self.entries
            .retain(|entry| !blocked.contains(entry.post.author_id.as_str()));
    }
}
