// SPDX-License-Identifier: MPL-2.0

//! Optimistic social actions.
//!
//! Every like, share, bookmark, follow and block goes through [`apply`]:
//! the local state changes first, then the write is sent, and a failed write
//! puts the local state back exactly as it was. Blocks additionally force a
//! full refetch because they change which posts are visible.

use crate::service::{
    ChangeOp, Counter, DataService, PostId, RelationshipChange, RelationshipKind, ServiceError,
    UserId,
};
use crate::state::session::{self, RefreshError, SessionState};
use crate::state::Memberships;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("not signed in")]
    Unauthenticated,
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("write failed: {0}")]
    DurableWriteFailure(#[source] ServiceError),
    #[error("session disposed")]
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The write succeeded; local state already reflected it
    Applied,
    /// Nothing to do: the relationship was already in the requested state
    AlreadyApplied,
    /// The write succeeded but the follow-up refetch did not
    AppliedPendingRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Add,
    Remove,
}

impl Direction {
    fn step(self) -> i64 {
        match self {
            Self::Add => 1,
            Self::Remove => -1,
        }
    }

    fn inverse(self) -> Self {
        match self {
            Self::Add => Self::Remove,
            Self::Remove => Self::Add,
        }
    }
}

/// A user-initiated social action and its target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocialAction {
    Like(PostId),
    Unlike(PostId),
    Share(PostId),
    Unshare(PostId),
    Bookmark(PostId),
    Unbookmark(PostId),
    Follow(UserId),
    Unfollow(UserId),
    Block(UserId),
    /// Never succeeds; blocks are permanent
    Unblock(UserId),
}

impl SocialAction {
    pub fn kind(&self) -> RelationshipKind {
        match self {
            Self::Like(_) | Self::Unlike(_) => RelationshipKind::Like,
            Self::Share(_) | Self::Unshare(_) => RelationshipKind::Share,
            Self::Bookmark(_) | Self::Unbookmark(_) => RelationshipKind::Bookmark,
            Self::Follow(_) | Self::Unfollow(_) => RelationshipKind::Follow,
            Self::Block(_) | Self::Unblock(_) => RelationshipKind::Block,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Like(_)
            | Self::Share(_)
            | Self::Bookmark(_)
            | Self::Follow(_)
            | Self::Block(_) => Direction::Add,
            Self::Unlike(_)
            | Self::Unshare(_)
            | Self::Unbookmark(_)
            | Self::Unfollow(_)
            | Self::Unblock(_) => Direction::Remove,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Like(p)
            | Self::Unlike(p)
            | Self::Share(p)
            | Self::Unshare(p)
            | Self::Bookmark(p)
            | Self::Unbookmark(p) => p.as_str(),
            Self::Follow(u) | Self::Unfollow(u) | Self::Block(u) | Self::Unblock(u) => u.as_str(),
        }
    }

    pub fn new(kind: RelationshipKind, direction: Direction, target: &str) -> Self {
        let post = || PostId::new(target);
        let user = || UserId::new(target);
        match (kind, direction) {
            (RelationshipKind::Like, Direction::Add) => Self::Like(post()),
            (RelationshipKind::Like, Direction::Remove) => Self::Unlike(post()),
            (RelationshipKind::Share, Direction::Add) => Self::Share(post()),
            (RelationshipKind::Share, Direction::Remove) => Self::Unshare(post()),
            (RelationshipKind::Bookmark, Direction::Add) => Self::Bookmark(post()),
            (RelationshipKind::Bookmark, Direction::Remove) => Self::Unbookmark(post()),
            (RelationshipKind::Follow, Direction::Add) => Self::Follow(user()),
            (RelationshipKind::Follow, Direction::Remove) => Self::Unfollow(user()),
            (RelationshipKind::Block, Direction::Add) => Self::Block(user()),
            (RelationshipKind::Block, Direction::Remove) => Self::Unblock(user()),
        }
    }

    /// What a tap on the `kind` button for `target` means right now:
    /// add if absent, remove if present. Blocked users stay blocked.
    pub fn toggle(kind: RelationshipKind, target: &str, memberships: &Memberships) -> Self {
        let direction = if memberships.contains(kind, target) && kind != RelationshipKind::Block {
            Direction::Remove
        } else {
            Direction::Add
        };
        Self::new(kind, direction, target)
    }
}

impl fmt::Display for SocialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.direction() {
            Direction::Add => "",
            Direction::Remove => "un",
        };
        write!(f, "{verb}{} {}", self.kind(), self.target())
    }
}

/// Where an optimistic counter change landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Feed(usize),
    Trending(usize),
}

/// The local mutation made for one action, with enough detail to undo it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Delta {
    kind: RelationshipKind,
    target: String,
    direction: Direction,
    counter: Option<Counter>,
    /// Amount each slot actually moved; 0 where a decrement hit the floor
    applied: Vec<(Slot, i64)>,
    write: u64,
    epoch: u64,
    trending_epoch: u64,
}

static NEXT_WRITE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingWrite {
    id: u64,
    direction: Direction,
    settled: bool,
}

/// Optimistic changes per relationship row, oldest first, kept until every
/// write on the row has either landed or been rolled back.
///
/// Consecutive entries on one row always alternate direction, since a
/// repeated tap is a no-op. When a write fails underneath a newer one, the
/// newer write becomes a no-op on the service as well, so the pair cancels
/// and local state already shows the right thing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PendingWrites {
    rows: HashMap<(RelationshipKind, String), Vec<PendingWrite>>,
}

impl PendingWrites {
    fn begin(&mut self, kind: RelationshipKind, target: &str, direction: Direction) -> u64 {
        let id = NEXT_WRITE.fetch_add(1, Ordering::Relaxed);
        self.rows
            .entry((kind, target.to_string()))
            .or_default()
            .push(PendingWrite {
                id,
                direction,
                settled: false,
            });
        id
    }

    fn settle(&mut self, kind: RelationshipKind, target: &str, id: u64) {
        self.update(kind, target, |writes| {
            if let Some(write) = writes.iter_mut().find(|w| w.id == id) {
                write.settled = true;
            }
        });
    }

    /// Forget a failed write. Returns whether its local change should be
    /// undone.
    fn fail(&mut self, kind: RelationshipKind, target: &str, id: u64) -> bool {
        let mut undo = false;
        self.update(kind, target, |writes| {
            let Some(pos) = writes.iter().position(|w| w.id == id) else {
                return;
            };
            if pos + 1 == writes.len() {
                writes.pop();
                undo = true;
            } else {
                writes.drain(pos..=pos + 1);
            }
        });
        undo
    }

    /// The service was seen holding the row in the state `direction` leads to.
    fn confirm(&mut self, kind: RelationshipKind, target: &str, direction: Direction) {
        self.update(kind, target, |writes| {
            writes.retain(|w| w.direction != direction);
        });
    }

    fn forget(&mut self, kind: RelationshipKind, target: &str) {
        self.rows.remove(&(kind, target.to_string()));
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
    }

    fn update(
        &mut self,
        kind: RelationshipKind,
        target: &str,
        f: impl FnOnce(&mut Vec<PendingWrite>),
    ) {
        let key = (kind, target.to_string());
        let Some(writes) = self.rows.get_mut(&key) else {
            return;
        };
        f(writes);
        if writes.iter().all(|w| w.settled) {
            self.rows.remove(&key);
        }
    }
}

enum Plan {
    Noop,
    Optimistic(Delta),
    Coarse(Delta),
}

/// Move `value` by `change`, clamped to the `u32` range. Returns the
/// change that actually happened.
fn step(value: &mut u32, change: i64) -> i64 {
    let before = *value;
    let magnitude = u32::try_from(change.unsigned_abs()).unwrap_or(u32::MAX);
    *value = if change >= 0 {
        before.saturating_add(magnitude)
    } else {
        before.saturating_sub(magnitude)
    };
    i64::from(*value) - i64::from(before)
}

impl SessionState {
    fn plan(&mut self, action: &SocialAction) -> Result<(UserId, Plan), ActionError> {
        if self.disposed {
            return Err(ActionError::Disposed);
        }
        let actor = self.actor.clone().ok_or(ActionError::Unauthenticated)?;

        let kind = action.kind();
        let direction = action.direction();
        let target = action.target();

        if kind == RelationshipKind::Block && direction == Direction::Remove {
            return Err(ActionError::NotSupported("blocks cannot be undone".into()));
        }
        if target.trim().is_empty() {
            return Err(ActionError::InvalidTarget(format!("empty {kind} target")));
        }
        if kind.targets_user() && target == actor.as_str() {
            return Err(ActionError::InvalidTarget(format!("cannot {kind} yourself")));
        }

        let present = self.memberships.contains(kind, target);
        let settled = match direction {
            Direction::Add => present,
            Direction::Remove => !present,
        };
        if settled {
            return Ok((actor, Plan::Noop));
        }

        let delta = self.apply_change(kind, target, direction);
        let plan = if kind == RelationshipKind::Block {
            Plan::Coarse(delta)
        } else {
            Plan::Optimistic(delta)
        };
        Ok((actor, plan))
    }

    /// Flip membership and move the associated counter by one.
    pub(crate) fn apply_change(
        &mut self,
        kind: RelationshipKind,
        target: &str,
        direction: Direction,
    ) -> Delta {
        let set = self.memberships.get_mut(kind);
        match direction {
            Direction::Add => set.insert(target),
            Direction::Remove => set.remove(target),
        };

        let counter = kind.counter();
        let applied = match counter {
            Some(counter) => self.adjust_counters(target, counter, direction.step()),
            None => Vec::new(),
        };

        Delta {
            kind,
            target: target.to_string(),
            direction,
            counter,
            applied,
            write: self.pending.begin(kind, target, direction),
            epoch: self.epoch,
            trending_epoch: self.trending_epoch,
        }
    }

    fn adjust_counters(
        &mut self,
        post_id: &str,
        counter: Counter,
        change: i64,
    ) -> Vec<(Slot, i64)> {
        let mut applied = Vec::new();

        for (i, post) in self.feed.iter_mut().enumerate() {
            if post.id.as_str() == post_id {
                applied.push((Slot::Feed(i), step(post.counter_mut(counter), change)));
            }
        }
        for (i, entry) in self.trending.entries_mut().iter_mut().enumerate() {
            if entry.post.id.as_str() == post_id {
                applied.push((Slot::Trending(i), step(entry.post.counter_mut(counter), change)));
                entry.rescore();
            }
        }

        applied
    }

    /// Mark the write behind `delta` as landed
    pub(crate) fn settle(&mut self, delta: &Delta) {
        self.pending.settle(delta.kind, &delta.target, delta.write);
    }

    /// Undo `delta` after its write failed. Skipped when a refetch has
    /// replaced the state it was applied to, the session is gone, or a
    /// later action or pushed change on the same row has taken over.
    /// Returns whether anything changed.
    pub(crate) fn revert(&mut self, delta: &Delta) -> bool {
        if self.disposed || delta.epoch != self.epoch {
            return false;
        }
        if !self.pending.fail(delta.kind, &delta.target, delta.write) {
            return false;
        }

        let set = self.memberships.get_mut(delta.kind);
        match delta.direction.inverse() {
            Direction::Add => set.insert(&delta.target),
            Direction::Remove => set.remove(&delta.target),
        };

        let Some(counter) = delta.counter else {
            return true;
        };
        for &(slot, applied) in &delta.applied {
            match slot {
                Slot::Feed(i) => {
                    if let Some(post) = self.feed.get_mut(i) {
                        step(post.counter_mut(counter), -applied);
                    }
                }
                Slot::Trending(i) => {
                    if delta.trending_epoch != self.trending_epoch {
                        continue;
                    }
                    if let Some(entry) = self.trending.entries_mut().get_mut(i) {
                        step(entry.post.counter_mut(counter), -applied);
                        entry.rescore();
                    }
                }
            }
        }
        true
    }

    /// Fold in a pushed change to one of the actor's own relationships.
    ///
    /// Keyed off membership, so a confirmation of something already applied
    /// locally changes nothing. Returns whether local state changed.
    pub fn reconcile_remote(&mut self, change: &RelationshipChange) -> bool {
        if self.disposed || self.actor.as_ref() != Some(&change.actor) {
            return false;
        }

        let direction = match change.op {
            ChangeOp::Insert => Direction::Add,
            ChangeOp::Delete => Direction::Remove,
        };
        let present = self.memberships.contains(change.kind, &change.target);
        let settled = match direction {
            Direction::Add => present,
            Direction::Remove => !present,
        };
        if settled {
            self.pending.confirm(change.kind, &change.target, direction);
            return false;
        }

        self.apply_change(change.kind, &change.target, direction);
        self.pending.forget(change.kind, &change.target);
        true
    }
}

/// Run `action` against `service`, updating `state` optimistically.
pub(crate) async fn apply<S: DataService>(
    service: &S,
    state: &Mutex<SessionState>,
    action: SocialAction,
) -> Result<ActionOutcome, ActionError> {
    let (actor, plan) = session::lock(state).plan(&action)?;

    match plan {
        Plan::Noop => {
            tracing::debug!(%action, "already applied");
            Ok(ActionOutcome::AlreadyApplied)
        }
        Plan::Optimistic(delta) => match write(service, &action, &actor).await {
            Ok(()) => {
                session::lock(state).settle(&delta);
                tracing::info!(%action, "applied");
                Ok(ActionOutcome::Applied)
            }
            Err(e) => {
                let reverted = session::lock(state).revert(&delta);
                tracing::warn!(%action, error = %e, reverted, "write failed, rolled back");
                Err(ActionError::DurableWriteFailure(e))
            }
        },
        Plan::Coarse(delta) => {
            if let Err(e) = write(service, &action, &actor).await {
                let reverted = session::lock(state).revert(&delta);
                tracing::warn!(%action, error = %e, reverted, "write failed, rolled back");
                return Err(ActionError::DurableWriteFailure(e));
            }
            session::lock(state).settle(&delta);

            match session::refetch(service, state).await {
                Ok(()) => {
                    tracing::info!(%action, "applied, feed refetched");
                    Ok(ActionOutcome::Applied)
                }
                Err(RefreshError::Disposed) => Ok(ActionOutcome::AppliedPendingRefresh),
                Err(e) => {
                    tracing::warn!(%action, error = %e, "applied, refetch failed");
                    Ok(ActionOutcome::AppliedPendingRefresh)
                }
            }
        }
    }
}

async fn write<S: DataService>(
    service: &S,
    action: &SocialAction,
    actor: &UserId,
) -> Result<(), ServiceError> {
    match action.direction() {
        Direction::Add => {
            service
                .insert_relationship(action.kind(), actor, action.target())
                .await
        }
        Direction::Remove => {
            service
                .delete_relationship(action.kind(), actor, action.target())
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::TrendingWindow;
    use crate::service::{MemoryDataService, Post};
    use crate::state::Session;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    fn me() -> UserId {
        UserId::new("me")
    }

    fn post(id: &str, author: &str, likes: u32, shares: u32) -> Post {
        Post {
            id: PostId::new(id),
            author_id: UserId::new(author),
            created_at: Utc::now() - Duration::hours(1),
            likes_count: likes,
            shares_count: shares,
            replies_count: 0,
        }
    }

    fn seeded() -> Arc<MemoryDataService> {
        let service = MemoryDataService::with_actor(me());
        service.put_post(post("p1", "alice", 0, 0));
        service.put_post(post("p2", "bob", 5, 2));
        service.put_post(post("p3", "alice", 1, 0));
        Arc::new(service)
    }

    async fn mount(service: &Arc<MemoryDataService>) -> Session<MemoryDataService> {
        Session::mount(Arc::clone(service), TrendingWindow::Week)
            .await
            .unwrap()
    }

    fn likes(session: &Session<MemoryDataService>, id: &str) -> u32 {
        session
            .state()
            .post(&PostId::new(id))
            .map(|p| p.likes_count)
            .unwrap()
    }

    #[tokio::test]
    async fn test_like_applies_and_persists() {
        let service = seeded();
        let session = mount(&service).await;

        let outcome = session.apply(SocialAction::Like(PostId::new("p1"))).await;
        assert_eq!(outcome, Ok(ActionOutcome::Applied));
        assert_eq!(likes(&session, "p1"), 1);
        assert!(session.state().memberships().is_liked(&PostId::new("p1")));
        assert!(service.has_relationship(RelationshipKind::Like, &me(), "p1"));
        assert_eq!(service.post(&PostId::new("p1")).unwrap().likes_count, 1);
    }

    #[tokio::test]
    async fn test_double_tap_in_flight_counts_once() {
        let service = seeded();
        let session = mount(&service).await;
        service.hold_writes();

        let (first, second, during) = tokio::join!(
            session.apply(SocialAction::Like(PostId::new("p1"))),
            session.apply(SocialAction::Like(PostId::new("p1"))),
            async {
                let during = session.state();
                service.release_writes(1);
                during
            },
        );

        assert_eq!(first, Ok(ActionOutcome::Applied));
        assert_eq!(second, Ok(ActionOutcome::AlreadyApplied));
        // the optimistic change was visible while the write was parked
        assert!(during.memberships().is_liked(&PostId::new("p1")));
        assert_eq!(during.post(&PostId::new("p1")).unwrap().likes_count, 1);

        assert_eq!(likes(&session, "p1"), 1);
        assert_eq!(service.write_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_restores_exact_state() {
        let service = seeded();
        let session = mount(&service).await;
        let before = session.state();

        service.fail_next_writes(1);
        let result = session.apply(SocialAction::Share(PostId::new("p2"))).await;

        assert!(matches!(result, Err(ActionError::DurableWriteFailure(_))));
        assert_eq!(session.state(), before);

        // retrying after the failure works
        let retry = session.apply(SocialAction::Share(PostId::new("p2"))).await;
        assert_eq!(retry, Ok(ActionOutcome::Applied));
        assert_eq!(session.state().post(&PostId::new("p2")).unwrap().shares_count, 3);
    }

    #[tokio::test]
    async fn test_failed_unlike_restores_like() {
        let service = seeded();
        service.seed_relationship(RelationshipKind::Like, &me(), "p3");
        let session = mount(&service).await;
        let before = session.state();

        service.fail_next_writes(1);
        let result = session.apply(SocialAction::Unlike(PostId::new("p3"))).await;

        assert!(result.is_err());
        assert_eq!(session.state(), before);
        assert_eq!(likes(&session, "p3"), 1);
    }

    #[tokio::test]
    async fn test_counter_never_negative() {
        let service = seeded();
        // liked according to membership, but the count snapshot says 0
        service.seed_relationship(RelationshipKind::Like, &me(), "p1");
        let session = mount(&service).await;
        assert_eq!(likes(&session, "p1"), 0);

        service.fail_writes_to("p1");
        let before = session.state();
        assert!(session.apply(SocialAction::Unlike(PostId::new("p1"))).await.is_err());
        assert_eq!(session.state(), before);

        service.clear_write_failures();
        assert_eq!(
            session.apply(SocialAction::Unlike(PostId::new("p1"))).await,
            Ok(ActionOutcome::Applied)
        );
        assert_eq!(likes(&session, "p1"), 0);
    }

    #[tokio::test]
    async fn test_concurrent_toggles_on_different_posts_are_independent() {
        let service = seeded();
        let session = mount(&service).await;
        service.hold_writes();
        service.fail_writes_to("p1");

        let (liked, shared, ()) = tokio::join!(
            session.apply(SocialAction::Like(PostId::new("p1"))),
            session.apply(SocialAction::Share(PostId::new("p2"))),
            async { service.release_writes(2) },
        );

        assert!(matches!(liked, Err(ActionError::DurableWriteFailure(_))));
        assert_eq!(shared, Ok(ActionOutcome::Applied));

        let state = session.state();
        assert!(!state.memberships().is_liked(&PostId::new("p1")));
        assert_eq!(state.post(&PostId::new("p1")).unwrap().likes_count, 0);
        assert!(state.memberships().is_shared(&PostId::new("p2")));
        assert_eq!(state.post(&PostId::new("p2")).unwrap().shares_count, 3);
    }

    #[tokio::test]
    async fn test_remove_when_absent_is_noop() {
        let service = seeded();
        let session = mount(&service).await;

        let outcome = session
            .apply(SocialAction::Unbookmark(PostId::new("p1")))
            .await;
        assert_eq!(outcome, Ok(ActionOutcome::AlreadyApplied));
        let outcome = session.apply(SocialAction::Unfollow(UserId::new("bob"))).await;
        assert_eq!(outcome, Ok(ActionOutcome::AlreadyApplied));
        assert_eq!(service.write_count(), 0);
    }

    #[tokio::test]
    async fn test_bookmark_and_follow_have_no_counter() {
        let service = seeded();
        let session = mount(&service).await;
        let before = session.state().post(&PostId::new("p2")).cloned();

        session
            .apply(SocialAction::Bookmark(PostId::new("p2")))
            .await
            .unwrap();
        session
            .apply(SocialAction::Follow(UserId::new("bob")))
            .await
            .unwrap();

        let state = session.state();
        assert_eq!(state.post(&PostId::new("p2")).cloned(), before);
        assert!(state.memberships().is_bookmarked(&PostId::new("p2")));
        assert!(state.memberships().is_following(&UserId::new("bob")));
        assert_eq!(state.bookmarked_posts().len(), 1);
    }

    #[tokio::test]
    async fn test_unauthenticated_changes_nothing() {
        let service = seeded();
        service.set_actor(None);
        let session = mount(&service).await;
        let before = session.state();

        let result = session.apply(SocialAction::Like(PostId::new("p1"))).await;
        assert_eq!(result, Err(ActionError::Unauthenticated));
        assert_eq!(session.state(), before);
        assert_eq!(service.write_count(), 0);
    }

    #[tokio::test]
    async fn test_self_follow_and_self_block_rejected() {
        let service = seeded();
        let session = mount(&service).await;
        let before = session.state();

        let follow = session.apply(SocialAction::Follow(me())).await;
        assert!(matches!(follow, Err(ActionError::InvalidTarget(_))));
        let block = session.apply(SocialAction::Block(me())).await;
        assert!(matches!(block, Err(ActionError::InvalidTarget(_))));

        assert_eq!(session.state(), before);
        assert!(!session.state().memberships().is_following(&me()));
        assert_eq!(service.write_count(), 0);
    }

    #[tokio::test]
    async fn test_unblock_not_supported() {
        let service = seeded();
        service.seed_relationship(RelationshipKind::Block, &me(), "troll");
        let session = mount(&service).await;

        let result = session.apply(SocialAction::Unblock(UserId::new("troll"))).await;
        assert!(matches!(result, Err(ActionError::NotSupported(_))));
        assert!(session.state().memberships().is_blocked(&UserId::new("troll")));
    }

    #[tokio::test]
    async fn test_block_refetches_and_hides_author() {
        let service = seeded();
        service.seed_relationship(RelationshipKind::Follow, &me(), "alice");
        let session = mount(&service).await;
        assert_eq!(session.state().feed().len(), 3);

        let outcome = session.apply(SocialAction::Block(UserId::new("alice"))).await;
        assert_eq!(outcome, Ok(ActionOutcome::Applied));

        let state = session.state();
        assert!(state.memberships().is_blocked(&UserId::new("alice")));
        assert_eq!(state.feed().len(), 1);
        assert_eq!(state.feed()[0].id.as_str(), "p2");
        // blocking leaves an existing follow alone
        assert!(state.memberships().is_following(&UserId::new("alice")));

        let again = session.apply(SocialAction::Block(UserId::new("alice"))).await;
        assert_eq!(again, Ok(ActionOutcome::AlreadyApplied));
    }

    #[tokio::test]
    async fn test_block_with_failed_refetch_still_stands() {
        let service = seeded();
        let session = mount(&service).await;

        service.fail_next_fetches(1);
        let outcome = session.apply(SocialAction::Block(UserId::new("bob"))).await;
        assert_eq!(outcome, Ok(ActionOutcome::AppliedPendingRefresh));
        assert!(session.state().memberships().is_blocked(&UserId::new("bob")));
        assert!(service.has_relationship(RelationshipKind::Block, &me(), "bob"));
    }

    #[tokio::test]
    async fn test_failed_block_rolls_back_membership() {
        let service = seeded();
        let session = mount(&service).await;
        let before = session.state();

        service.fail_next_writes(1);
        let result = session.apply(SocialAction::Block(UserId::new("bob"))).await;
        assert!(matches!(result, Err(ActionError::DurableWriteFailure(_))));
        assert_eq!(session.state(), before);
    }

    #[tokio::test]
    async fn test_rollback_discarded_after_dispose() {
        let service = seeded();
        let session = mount(&service).await;
        service.hold_writes();
        service.fail_writes_to("p1");

        let (result, ()) = tokio::join!(
            session.apply(SocialAction::Like(PostId::new("p1"))),
            async {
                session.dispose();
                service.release_writes(1);
            },
        );

        assert!(matches!(result, Err(ActionError::DurableWriteFailure(_))));
        let state = session.state();
        assert!(state.is_disposed());
        assert!(state.memberships().is_liked(&PostId::new("p1")));

        let late = session.apply(SocialAction::Like(PostId::new("p2"))).await;
        assert_eq!(late, Err(ActionError::Disposed));
    }

    #[tokio::test]
    async fn test_remote_confirmation_is_idempotent() {
        let service = seeded();
        let session = mount(&service).await;
        session
            .apply(SocialAction::Like(PostId::new("p1")))
            .await
            .unwrap();

        let confirmation = RelationshipChange {
            kind: RelationshipKind::Like,
            op: ChangeOp::Insert,
            actor: me(),
            target: "p1".into(),
        };
        assert!(!session.reconcile_remote(&confirmation));
        assert_eq!(likes(&session, "p1"), 1);

        // same actor, other device
        let elsewhere = RelationshipChange {
            target: "p2".into(),
            ..confirmation.clone()
        };
        assert!(session.reconcile_remote(&elsewhere));
        assert!(!session.reconcile_remote(&elsewhere));
        assert_eq!(likes(&session, "p2"), 6);

        let someone_else = RelationshipChange {
            actor: UserId::new("bob"),
            target: "p3".into(),
            ..confirmation
        };
        assert!(!session.reconcile_remote(&someone_else));
        assert_eq!(likes(&session, "p3"), 1);
    }

    #[tokio::test]
    async fn test_like_updates_trending_entry() {
        let service = seeded();
        let session = mount(&service).await;
        session.refresh_trending(Utc::now()).await.unwrap();

        session
            .apply(SocialAction::Like(PostId::new("p3")))
            .await
            .unwrap();

        let state = session.state();
        let entry = state
            .trending()
            .entries()
            .iter()
            .find(|e| e.post.id.as_str() == "p3")
            .unwrap();
        assert_eq!(entry.post.likes_count, 2);
        assert_eq!(entry.engagement_score, 6);
    }

    /// Let both parked writes reach the gate, then pass them one at a time,
    /// arming a failure just before the write at index `fail_at`.
    async fn release_in_order(service: &MemoryDataService, fail_at: usize) {
        tokio::task::yield_now().await;
        for i in 0..2 {
            if i == fail_at {
                service.fail_next_writes(1);
            }
            service.release_writes(1);
            while service.write_count() <= i {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn test_opposite_taps_in_flight_first_write_fails() {
        let service = seeded();
        let session = mount(&service).await;
        service.hold_writes();

        let (like, unlike, ()) = tokio::join!(
            session.toggle(RelationshipKind::Like, "p2"),
            session.toggle(RelationshipKind::Like, "p2"),
            release_in_order(&service, 0),
        );

        assert!(matches!(like, Err(ActionError::DurableWriteFailure(_))));
        assert_eq!(unlike, Ok(ActionOutcome::Applied));
        assert!(!session.state().memberships().is_liked(&PostId::new("p2")));
        assert_eq!(likes(&session, "p2"), 5);
        assert_eq!(service.post(&PostId::new("p2")).unwrap().likes_count, 5);
    }

    #[tokio::test]
    async fn test_opposite_taps_in_flight_second_write_fails() {
        let service = seeded();
        let session = mount(&service).await;
        service.hold_writes();

        let (like, unlike, ()) = tokio::join!(
            session.toggle(RelationshipKind::Like, "p2"),
            session.toggle(RelationshipKind::Like, "p2"),
            release_in_order(&service, 1),
        );

        assert_eq!(like, Ok(ActionOutcome::Applied));
        assert!(matches!(unlike, Err(ActionError::DurableWriteFailure(_))));
        assert!(session.state().memberships().is_liked(&PostId::new("p2")));
        assert_eq!(likes(&session, "p2"), 6);
        assert_eq!(service.post(&PostId::new("p2")).unwrap().likes_count, 6);
    }

    #[tokio::test]
    async fn test_opposite_taps_in_flight_both_writes_fail() {
        let service = seeded();
        let session = mount(&service).await;
        let before = session.state();
        service.hold_writes();
        service.fail_writes_to("p2");

        let (like, unlike, ()) = tokio::join!(
            session.toggle(RelationshipKind::Like, "p2"),
            session.toggle(RelationshipKind::Like, "p2"),
            async {
                tokio::task::yield_now().await;
                service.release_writes(2);
            },
        );

        assert!(like.is_err());
        assert!(unlike.is_err());
        assert_eq!(session.state(), before);
    }

    #[tokio::test]
    async fn test_remote_confirmation_before_failed_write_keeps_like() {
        let service = seeded();
        let session = mount(&service).await;
        service.hold_writes();
        service.fail_writes_to("p1");

        let (result, confirmed) = tokio::join!(
            session.apply(SocialAction::Like(PostId::new("p1"))),
            async {
                tokio::task::yield_now().await;
                // the same like, saved from another device
                service.seed_relationship(RelationshipKind::Like, &me(), "p1");
                let confirmed = session.reconcile_remote(&RelationshipChange {
                    kind: RelationshipKind::Like,
                    op: ChangeOp::Insert,
                    actor: me(),
                    target: "p1".into(),
                });
                service.release_writes(1);
                confirmed
            },
        );

        assert!(matches!(result, Err(ActionError::DurableWriteFailure(_))));
        assert!(!confirmed);
        assert!(session.state().memberships().is_liked(&PostId::new("p1")));
        assert_eq!(likes(&session, "p1"), 1);
        assert!(service.has_relationship(RelationshipKind::Like, &me(), "p1"));
    }

    #[test]
    fn test_failed_write_under_newer_one_cancels_the_pair() {
        let mut pending = PendingWrites::default();
        let like = pending.begin(RelationshipKind::Like, "p1", Direction::Add);
        let unlike = pending.begin(RelationshipKind::Like, "p1", Direction::Remove);
        let relike = pending.begin(RelationshipKind::Like, "p1", Direction::Add);

        assert!(!pending.fail(RelationshipKind::Like, "p1", like));
        assert!(!pending.fail(RelationshipKind::Like, "p1", unlike));
        assert!(pending.fail(RelationshipKind::Like, "p1", relike));
        assert_eq!(pending, PendingWrites::default());
    }

    #[test]
    fn test_settled_writes_are_forgotten() {
        let mut pending = PendingWrites::default();
        let like = pending.begin(RelationshipKind::Like, "p1", Direction::Add);
        let share = pending.begin(RelationshipKind::Share, "p1", Direction::Add);
        pending.settle(RelationshipKind::Like, "p1", like);
        pending.confirm(RelationshipKind::Share, "p1", Direction::Add);

        assert_eq!(pending, PendingWrites::default());
        assert!(!pending.fail(RelationshipKind::Share, "p1", share));
    }

    #[test]
    fn test_toggle_picks_direction() {
        let mut memberships = Memberships::default();
        assert_eq!(
            SocialAction::toggle(RelationshipKind::Like, "p1", &memberships),
            SocialAction::Like(PostId::new("p1"))
        );

        memberships.get_mut(RelationshipKind::Like).insert("p1");
        memberships.get_mut(RelationshipKind::Block).insert("u1");
        assert_eq!(
            SocialAction::toggle(RelationshipKind::Like, "p1", &memberships),
            SocialAction::Unlike(PostId::new("p1"))
        );
        assert_eq!(
            SocialAction::toggle(RelationshipKind::Block, "u1", &memberships),
            SocialAction::Block(UserId::new("u1"))
        );
    }

    #[test]
    fn test_action_display() {
        assert_eq!(SocialAction::Unfollow(UserId::new("bob")).to_string(), "unfollow bob");
        assert_eq!(SocialAction::Share(PostId::new("p9")).to_string(), "share p9");
    }

    #[test]
    fn test_step_clamps_at_zero() {
        let mut value = 0;
        assert_eq!(step(&mut value, -1), 0);
        assert_eq!(value, 0);
        assert_eq!(step(&mut value, 1), 1);
        let mut max = u32::MAX;
        assert_eq!(step(&mut max, 1), 0);
    }
}
