// SPDX-License-Identifier: MPL-2.0

//! Client core for a social app backed by a hosted data service.
//!
//! [`Session`] holds the signed-in user's feed, relationship sets and
//! trending board. Social actions go through [`Session::apply`], which
//! updates local state immediately and rolls it back if the write fails.
//! [`ranking::rank`] orders posts by engagement for the trending view.

pub mod actions;
pub mod config;
pub mod logging;
pub mod ranking;
mod runtime;
pub mod service;
pub mod state;

pub use actions::{ActionError, ActionOutcome, Direction, SocialAction};
pub use ranking::{RankedPost, TrendingBoard, TrendingWindow, rank};
pub use service::{
    DataService, MemoryDataService, Post, PostId, RelationshipKind, RestDataService,
    ServiceError, UserId,
};
pub use state::{ClientSettings, RefreshError, Session, SessionState};
