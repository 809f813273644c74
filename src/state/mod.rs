// SPDX-License-Identifier: MPL-2.0

mod membership;
pub(crate) mod session;
pub mod settings;

pub use membership::{MembershipSet, Memberships};
pub use session::{RefreshError, Session, SessionState};
pub use settings::{ClientSettings, SettingsError};
