// SPDX-License-Identifier: MPL-2.0

//! Boundary to the hosted data service.
//!
//! Everything the core knows about the backend goes through [`DataService`].
//! Responses are parsed into the types re-exported here before they reach the
//! reconciler or the ranking code.

mod memory;
mod rest;
mod types;

pub use memory::MemoryDataService;
pub use rest::RestDataService;
pub use types::{
    ChangeOp, Counter, Post, PostFilter, PostId, RelationshipChange, RelationshipKind, Table,
    TableChange, UserId,
};

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("network error: {0}")]
    Network(String),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Callback invoked when a watched table changes.
pub type ChangeCallback = Arc<dyn Fn(TableChange) + Send + Sync>;

/// Live subscription; dropping it stops delivery.
pub struct SubscriptionHandle {
    table: Table,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(table: Table, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            table,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    /// Stop delivery now rather than at drop time
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("table", &self.table)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Operations the core needs from the backend.
pub trait DataService: Send + Sync {
    /// The signed-in user, or `None` for an anonymous session
    fn current_actor(&self) -> impl Future<Output = Result<Option<UserId>, ServiceError>> + Send;

    /// Create the row `(actor, target)` in the table for `kind`
    fn insert_relationship(
        &self,
        kind: RelationshipKind,
        actor: &UserId,
        target: &str,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Delete the row `(actor, target)` from the table for `kind`.
    /// Blocks cannot be deleted.
    fn delete_relationship(
        &self,
        kind: RelationshipKind,
        actor: &UserId,
        target: &str,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Posts with their interaction counts, newest first
    fn fetch_posts(
        &self,
        filter: PostFilter,
    ) -> impl Future<Output = Result<Vec<Post>, ServiceError>> + Send;

    /// Target ids the actor has a `kind` relationship with
    fn fetch_membership(
        &self,
        actor: &UserId,
        kind: RelationshipKind,
    ) -> impl Future<Output = Result<HashSet<String>, ServiceError>> + Send;

    /// Watch a table for changes
    fn subscribe(
        &self,
        table: Table,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle, ServiceError>;
}
