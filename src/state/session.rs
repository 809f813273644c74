// SPDX-License-Identifier: MPL-2.0

use crate::actions::{self, ActionError, ActionOutcome, PendingWrites, SocialAction};
use crate::ranking::{TrendingBoard, TrendingWindow};
use crate::service::{
    ChangeCallback, DataService, Post, PostFilter, PostId, RelationshipChange, RelationshipKind,
    ServiceError, SubscriptionHandle, Table, TableChange, UserId,
};
use crate::state::{MembershipSet, Memberships};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("fetch failed: {0}")]
    FetchFailure(#[source] ServiceError),
    #[error("session disposed")]
    Disposed,
}

/// In-memory view of the service for one signed-in session.
///
/// Everything here is a re-derivable cache: a refetch replaces it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub(crate) actor: Option<UserId>,
    pub(crate) feed: Vec<Post>,
    pub(crate) memberships: Memberships,
    pub(crate) trending: TrendingBoard,
    /// Bumped whenever the feed or memberships are replaced
    pub(crate) epoch: u64,
    /// Bumped whenever the trending entries are replaced
    pub(crate) trending_epoch: u64,
    /// Local writes per target that may still need rolling back
    pub(crate) pending: PendingWrites,
    pub(crate) disposed: bool,
}

impl SessionState {
    pub fn new(window: TrendingWindow) -> Self {
        Self {
            trending: TrendingBoard::new(window),
            ..Self::default()
        }
    }

    pub fn actor(&self) -> Option<&UserId> {
        self.actor.as_ref()
    }

    pub fn feed(&self) -> &[Post] {
        &self.feed
    }

    /// Look a post up in the feed, then on the trending board
    pub fn post(&self, id: &PostId) -> Option<&Post> {
        self.feed.iter().find(|p| p.id == *id).or_else(|| {
            self.trending
                .entries()
                .iter()
                .map(|e| &e.post)
                .find(|p| p.id == *id)
        })
    }

    pub fn memberships(&self) -> &Memberships {
        &self.memberships
    }

    pub fn trending(&self) -> &TrendingBoard {
        &self.trending
    }

    /// Feed posts the actor has bookmarked, in feed order
    pub fn bookmarked_posts(&self) -> Vec<&Post> {
        self.feed
            .iter()
            .filter(|p| self.memberships.is_bookmarked(&p.id))
            .collect()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn visible(blocked: &MembershipSet, posts: Vec<Post>) -> Vec<Post> {
        posts
            .into_iter()
            .filter(|p| !blocked.contains(p.author_id.as_str()))
            .collect()
    }

    fn replace(&mut self, actor: Option<UserId>, posts: Vec<Post>, memberships: Memberships) {
        let blocked = memberships.get(RelationshipKind::Block);
        self.feed = Self::visible(blocked, posts);
        self.trending.hide_authors(blocked);
        self.actor = actor;
        self.memberships = memberships;
        self.pending.clear();
        self.epoch += 1;
        self.trending_epoch += 1;
    }

    fn rerank(&mut self, window: TrendingWindow, candidates: Vec<Post>, now: DateTime<Utc>) {
        let candidates = Self::visible(self.memberships.get(RelationshipKind::Block), candidates);
        self.trending.rerank(window, &candidates, now);
        self.trending_epoch += 1;
    }
}

pub(crate) fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replace the feed and every membership set with fresh service data.
/// On failure the current state is left untouched.
pub(crate) async fn refetch<S: DataService>(
    service: &S,
    state: &Mutex<SessionState>,
) -> Result<(), RefreshError> {
    if lock(state).disposed {
        return Err(RefreshError::Disposed);
    }

    let actor = service
        .current_actor()
        .await
        .map_err(RefreshError::FetchFailure)?;
    let posts = service
        .fetch_posts(PostFilter::default())
        .await
        .map_err(RefreshError::FetchFailure)?;
    let memberships = match &actor {
        Some(actor) => fetch_memberships(service, actor)
            .await
            .map_err(RefreshError::FetchFailure)?,
        None => Memberships::default(),
    };

    let mut state = lock(state);
    if state.disposed {
        return Err(RefreshError::Disposed);
    }
    tracing::debug!(
        actor = ?actor,
        posts = posts.len(),
        following = memberships.get(RelationshipKind::Follow).len(),
        "session refetched"
    );
    state.replace(actor, posts, memberships);
    Ok(())
}

async fn fetch_memberships<S: DataService>(
    service: &S,
    actor: &UserId,
) -> Result<Memberships, ServiceError> {
    let (liked, shared, bookmarked, following, blocked) = tokio::try_join!(
        service.fetch_membership(actor, RelationshipKind::Like),
        service.fetch_membership(actor, RelationshipKind::Share),
        service.fetch_membership(actor, RelationshipKind::Bookmark),
        service.fetch_membership(actor, RelationshipKind::Follow),
        service.fetch_membership(actor, RelationshipKind::Block),
    )?;

    let mut memberships = Memberships::default();
    memberships.set(RelationshipKind::Like, liked.into());
    memberships.set(RelationshipKind::Share, shared.into());
    memberships.set(RelationshipKind::Bookmark, bookmarked.into());
    memberships.set(RelationshipKind::Follow, following.into());
    memberships.set(RelationshipKind::Block, blocked.into());
    Ok(memberships)
}

/// A mounted session: the state object every view shares, plus the
/// service it talks to.
///
/// Created with [`Session::mount`], ended with [`Session::dispose`] (or by
/// dropping it). Results of writes that land after disposal are discarded.
pub struct Session<S: DataService> {
    service: Arc<S>,
    state: Arc<Mutex<SessionState>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    invalidate_tx: Mutex<Option<mpsc::UnboundedSender<Table>>>,
    invalidate_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Table>>,
}

impl<S: DataService> Session<S> {
    /// Resolve the actor and load the feed and memberships
    pub async fn mount(service: Arc<S>, window: TrendingWindow) -> Result<Self, RefreshError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            service,
            state: Arc::new(Mutex::new(SessionState::new(window))),
            subscriptions: Mutex::new(Vec::new()),
            invalidate_tx: Mutex::new(Some(tx)),
            invalidate_rx: tokio::sync::Mutex::new(rx),
        };

        session.refresh().await?;
        tracing::info!(actor = ?session.state().actor(), "session mounted");
        Ok(session)
    }

    /// Copy of the current state
    pub fn state(&self) -> SessionState {
        lock(&self.state).clone()
    }

    /// Read the current state without copying it
    pub fn with_state<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&lock(&self.state))
    }

    pub fn actor(&self) -> Option<UserId> {
        lock(&self.state).actor.clone()
    }

    /// Optimistically apply a social action
    pub async fn apply(&self, action: SocialAction) -> Result<ActionOutcome, ActionError> {
        actions::apply(&*self.service, &self.state, action).await
    }

    /// Apply whatever a tap on the `kind` button for `target` means now
    pub async fn toggle(
        &self,
        kind: RelationshipKind,
        target: &str,
    ) -> Result<ActionOutcome, ActionError> {
        let action = SocialAction::toggle(kind, target, &lock(&self.state).memberships);
        self.apply(action).await
    }

    /// Refetch the feed and memberships (pull-to-refresh)
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        refetch(&*self.service, &self.state).await.inspect_err(|e| {
            tracing::warn!(error = %e, "refresh failed, keeping previous state");
        })
    }

    /// Re-rank the trending board for its current window
    pub async fn refresh_trending(&self, now: DateTime<Utc>) -> Result<(), RefreshError> {
        let window = lock(&self.state).trending.window();
        self.set_trending_window(window, now).await
    }

    /// Switch the trending window and re-rank. On fetch failure the board
    /// keeps its previous window and entries.
    pub async fn set_trending_window(
        &self,
        window: TrendingWindow,
        now: DateTime<Utc>,
    ) -> Result<(), RefreshError> {
        if lock(&self.state).disposed {
            return Err(RefreshError::Disposed);
        }

        let filter = PostFilter {
            window_start: Some(window.start(now)),
        };
        let candidates = match self.service.fetch_posts(filter).await {
            Ok(posts) => posts,
            Err(e) => {
                tracing::warn!(window = window.label(), error = %e, "trending fetch failed");
                return Err(RefreshError::FetchFailure(e));
            }
        };

        let mut state = lock(&self.state);
        if state.disposed {
            return Err(RefreshError::Disposed);
        }
        state.rerank(window, candidates, now);
        tracing::debug!(
            window = window.label(),
            entries = state.trending.entries().len(),
            "trending ranked"
        );
        Ok(())
    }

    /// Fold a pushed change to the actor's own relationships into local state
    pub fn reconcile_remote(&self, change: &RelationshipChange) -> bool {
        lock(&self.state).reconcile_remote(change)
    }

    /// Subscribe to `tables`. Each change is reconciled if it carries row
    /// detail, then queued as a refetch request for [`Self::next_invalidation`].
    pub fn watch(&self, tables: &[Table]) -> Result<(), ServiceError> {
        let Some(tx) = self
            .invalidate_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return Ok(());
        };

        for &table in tables {
            let state = Arc::clone(&self.state);
            let tx = tx.clone();
            let on_change: ChangeCallback = Arc::new(move |change: TableChange| {
                if let Some(relationship) = &change.relationship {
                    lock(&state).reconcile_remote(relationship);
                }
                let _ = tx.send(change.table);
            });

            let handle = self.service.subscribe(table, on_change)?;
            tracing::debug!(table = table.name(), "watching");
            self.subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        Ok(())
    }

    /// Wait for the next watched changes. A burst is coalesced into one
    /// wake-up listing each changed table once, in arrival order. Returns
    /// `None` once the session is disposed.
    ///
    /// [`Self::refresh`] reloads the feed only; callers showing trending
    /// should also run [`Self::refresh_trending`] when posts or counters
    /// changed.
    pub async fn next_invalidation(&self) -> Option<Vec<Table>> {
        let mut rx = self.invalidate_rx.lock().await;
        let mut tables = vec![rx.recv().await?];
        while let Ok(table) = rx.try_recv() {
            if !tables.contains(&table) {
                tables.push(table);
            }
        }
        Some(tables)
    }

    /// End the session: stop subscriptions and ignore late results
    pub fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if state.disposed {
                return;
            }
            state.disposed = true;
        }

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.invalidate_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::info!("session disposed");
    }
}

impl<S: DataService> Drop for Session<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}
