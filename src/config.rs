// SPDX-License-Identifier: MPL-2.0

pub const APP_ID: &str = "io.github.murmur.Murmur";

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:54321";

/// Maximum number of posts on the trending board
pub const TRENDING_LIMIT: usize = 20;

/// Realtime poll interval when the settings file does not set one
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
