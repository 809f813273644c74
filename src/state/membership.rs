// SPDX-License-Identifier: MPL-2.0

use crate::service::{PostId, RelationshipKind, UserId};
use std::collections::HashSet;

/// Ids the current actor has a given relationship with.
///
/// An id is either a member or not; there is no pending state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSet {
    ids: HashSet<String>,
}

impl MembershipSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns `true` if the id was not already a member
    pub fn insert(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    /// Returns `true` if the id was a member
    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl From<HashSet<String>> for MembershipSet {
    fn from(ids: HashSet<String>) -> Self {
        Self { ids }
    }
}

impl<'a> FromIterator<&'a str> for MembershipSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().map(str::to_string).collect(),
        }
    }
}

/// Every relationship set the session tracks for the current actor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships {
    liked: MembershipSet,
    shared: MembershipSet,
    bookmarked: MembershipSet,
    following: MembershipSet,
    blocked: MembershipSet,
}

impl Memberships {
    pub fn get(&self, kind: RelationshipKind) -> &MembershipSet {
        match kind {
            RelationshipKind::Like => &self.liked,
            RelationshipKind::Share => &self.shared,
            RelationshipKind::Bookmark => &self.bookmarked,
            RelationshipKind::Follow => &self.following,
            RelationshipKind::Block => &self.blocked,
        }
    }

    pub fn get_mut(&mut self, kind: RelationshipKind) -> &mut MembershipSet {
        match kind {
            RelationshipKind::Like => &mut self.liked,
            RelationshipKind::Share => &mut self.shared,
            RelationshipKind::Bookmark => &mut self.bookmarked,
            RelationshipKind::Follow => &mut self.following,
            RelationshipKind::Block => &mut self.blocked,
        }
    }

    pub fn set(&mut self, kind: RelationshipKind, ids: MembershipSet) {
        *self.get_mut(kind) = ids;
    }

    pub fn contains(&self, kind: RelationshipKind, id: &str) -> bool {
        self.get(kind).contains(id)
    }

    pub fn is_liked(&self, post: &PostId) -> bool {
        self.liked.contains(post.as_str())
    }

    pub fn is_shared(&self, post: &PostId) -> bool {
        self.shared.contains(post.as_str())
    }

    pub fn is_bookmarked(&self, post: &PostId) -> bool {
        self.bookmarked.contains(post.as_str())
    }

    pub fn is_following(&self, user: &UserId) -> bool {
        self.following.contains(user.as_str())
    }

    pub fn is_blocked(&self, user: &UserId) -> bool {
        self.blocked.contains(user.as_str())
    }
}
