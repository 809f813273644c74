// SPDX-License-Identifier: MPL-2.0

//! Shared async runtime for background work.
//!
//! Realtime subscriptions run their polling loops here so that callers on a
//! UI thread without a Tokio context can still subscribe.

use once_cell::sync::Lazy;
use std::future::Future;
use tokio::runtime::Runtime;

/// Two workers are plenty for a handful of polling loops.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .thread_name("murmur-async")
        .build()
        .expect("failed to create async runtime")
});

/// Spawn a future on the shared runtime without blocking.
pub fn spawn<F>(future: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    RUNTIME.spawn(future)
}
