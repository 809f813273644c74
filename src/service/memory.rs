// SPDX-License-Identifier: MPL-2.0

use crate::service::types::{
    ChangeOp, Post, PostFilter, PostId, RelationshipChange, RelationshipKind, Table, TableChange,
    UserId,
};
use crate::service::{ChangeCallback, DataService, ServiceError, SubscriptionHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;

type Subscribers = Arc<Mutex<HashMap<u64, (Table, ChangeCallback)>>>;

/// In-process data service for offline use and tests.
///
/// Counters are maintained the way the hosted service aggregates them:
/// inserting a like bumps the post's `likes_count`, deleting it lowers it.
/// Writes can be made to fail or to wait until released.
#[derive(Default)]
pub struct MemoryDataService {
    inner: Mutex<Inner>,
    subscribers: Subscribers,
}

#[derive(Default)]
struct Inner {
    actor: Option<UserId>,
    posts: Vec<Post>,
    rows: HashMap<RelationshipKind, HashSet<(UserId, String)>>,
    failing_writes: usize,
    failing_targets: HashSet<String>,
    failing_fetches: usize,
    write_gate: Option<Arc<Semaphore>>,
    writes: usize,
    next_subscription: u64,
}

impl MemoryDataService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actor(actor: UserId) -> Self {
        let service = Self::new();
        service.set_actor(Some(actor));
        service
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_actor(&self, actor: Option<UserId>) {
        self.lock().actor = actor;
    }

    /// Add or replace a post
    pub fn put_post(&self, post: Post) {
        let mut inner = self.lock();
        inner.posts.retain(|p| p.id != post.id);
        inner.posts.push(post);
    }

    pub fn post(&self, id: &PostId) -> Option<Post> {
        self.lock().posts.iter().find(|p| p.id == *id).cloned()
    }

    /// Seed a relationship row without going through a write
    pub fn seed_relationship(&self, kind: RelationshipKind, actor: &UserId, target: &str) {
        self.lock()
            .rows
            .entry(kind)
            .or_default()
            .insert((actor.clone(), target.to_string()));
    }

    pub fn has_relationship(&self, kind: RelationshipKind, actor: &UserId, target: &str) -> bool {
        self.lock()
            .rows
            .get(&kind)
            .is_some_and(|rows| rows.contains(&(actor.clone(), target.to_string())))
    }

    /// Make the next `n` writes fail with a network error
    pub fn fail_next_writes(&self, n: usize) {
        self.lock().failing_writes = n;
    }

    /// Make every write touching `target` fail until cleared
    pub fn fail_writes_to(&self, target: &str) {
        self.lock().failing_targets.insert(target.to_string());
    }

    pub fn clear_write_failures(&self) {
        let mut inner = self.lock();
        inner.failing_writes = 0;
        inner.failing_targets.clear();
    }

    /// Make the next `n` post or membership fetches fail
    pub fn fail_next_fetches(&self, n: usize) {
        self.lock().failing_fetches = n;
    }

    /// Park every subsequent write until `release_writes` lets it through
    pub fn hold_writes(&self) {
        self.lock().write_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_writes(&self, n: usize) {
        if let Some(gate) = &self.lock().write_gate {
            gate.add_permits(n);
        }
    }

    /// Number of writes that reached the service (successful or not)
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn pass_gate(&self, target: &str) -> Result<(), ServiceError> {
        let gate = self.lock().write_gate.clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| ServiceError::Network(e.to_string()))?
                .forget();
        }

        let mut inner = self.lock();
        inner.writes += 1;
        if inner.failing_targets.contains(target) {
            return Err(ServiceError::Network(format!("injected write failure for {target}")));
        }
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(ServiceError::Network("injected write failure".into()));
        }
        Ok(())
    }

    fn take_fetch_failure(&self) -> Result<(), ServiceError> {
        let mut inner = self.lock();
        if inner.failing_fetches > 0 {
            inner.failing_fetches -= 1;
            return Err(ServiceError::Network("injected fetch failure".into()));
        }
        Ok(())
    }

    fn adjust_counter(inner: &mut Inner, kind: RelationshipKind, target: &str, op: ChangeOp) {
        let Some(counter) = kind.counter() else {
            return;
        };
        if let Some(post) = inner.posts.iter_mut().find(|p| p.id.as_str() == target) {
            let value = post.counter_mut(counter);
            *value = match op {
                ChangeOp::Insert => value.saturating_add(1),
                ChangeOp::Delete => value.saturating_sub(1),
            };
        }
    }

    fn publish(&self, change: RelationshipChange) {
        let table = change.kind.table();
        let callbacks: Vec<ChangeCallback> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(t, _)| *t == table)
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(TableChange {
                table,
                relationship: Some(change.clone()),
            });
        }
    }
}

impl DataService for MemoryDataService {
    async fn current_actor(&self) -> Result<Option<UserId>, ServiceError> {
        Ok(self.lock().actor.clone())
    }

    async fn insert_relationship(
        &self,
        kind: RelationshipKind,
        actor: &UserId,
        target: &str,
    ) -> Result<(), ServiceError> {
        self.pass_gate(target).await?;

        {
            let mut inner = self.lock();
            let inserted = inner
                .rows
                .entry(kind)
                .or_default()
                .insert((actor.clone(), target.to_string()));
            if !inserted {
                return Err(ServiceError::Status {
                    status: 409,
                    body: format!("duplicate {kind} row"),
                });
            }
            Self::adjust_counter(&mut inner, kind, target, ChangeOp::Insert);
        }

        self.publish(RelationshipChange {
            kind,
            op: ChangeOp::Insert,
            actor: actor.clone(),
            target: target.to_string(),
        });
        Ok(())
    }

    async fn delete_relationship(
        &self,
        kind: RelationshipKind,
        actor: &UserId,
        target: &str,
    ) -> Result<(), ServiceError> {
        if kind == RelationshipKind::Block {
            return Err(ServiceError::Unsupported("blocks cannot be removed".into()));
        }
        self.pass_gate(target).await?;

        let removed = {
            let mut inner = self.lock();
            let removed = inner
                .rows
                .get_mut(&kind)
                .is_some_and(|rows| rows.remove(&(actor.clone(), target.to_string())));
            if removed {
                Self::adjust_counter(&mut inner, kind, target, ChangeOp::Delete);
            }
            removed
        };

        if removed {
            self.publish(RelationshipChange {
                kind,
                op: ChangeOp::Delete,
                actor: actor.clone(),
                target: target.to_string(),
            });
        }
        Ok(())
    }

    async fn fetch_posts(&self, filter: PostFilter) -> Result<Vec<Post>, ServiceError> {
        self.take_fetch_failure()?;

        let mut posts: Vec<Post> = self
            .lock()
            .posts
            .iter()
            .filter(|p| filter.window_start.is_none_or(|start| p.created_at >= start))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(posts)
    }

    async fn fetch_membership(
        &self,
        actor: &UserId,
        kind: RelationshipKind,
    ) -> Result<HashSet<String>, ServiceError> {
        self.take_fetch_failure()?;

        Ok(self
            .lock()
            .rows
            .get(&kind)
            .map(|rows| {
                rows.iter()
                    .filter(|(a, _)| a == actor)
                    .map(|(_, target)| target.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn subscribe(
        &self,
        table: Table,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, ServiceError> {
        let id = {
            let mut inner = self.lock();
            inner.next_subscription += 1;
            inner.next_subscription
        };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (table, on_change));

        let subscribers = Arc::clone(&self.subscribers);
        Ok(SubscriptionHandle::new(table, move || {
            subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
        }))
    }
}
