//! Shared application state and memory management.

use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use nbexp_core::Exporter;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// `MALLCTL_ARENAS_ALL`: the purge covers every arena, tokio workers included.
#[cfg(not(target_env = "msvc"))]
const PURGE_ALL_ARENAS: &std::ffi::CStr = c"arena.4096.purge";

/// Hands dirty pages back to the OS after a scrape.
///
/// A long scrape window decodes many job pages; without a purge the
/// resident size stays at the peak of the largest scrape.
#[cfg(not(target_env = "msvc"))]
pub(crate) fn release_memory_to_os() {
    // SAFETY: "arena.<i>.purge" is a void control; no old or new value is
    // read or written.
    let rc = unsafe {
        tikv_jemalloc_sys::mallctl(
            PURGE_ALL_ARENAS.as_ptr().cast(),
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            0,
        )
    };
    if rc != 0 {
        debug!(rc, "jemalloc arena purge failed");
    }
}

#[cfg(target_env = "msvc")]
pub(crate) fn release_memory_to_os() {}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) exporter: Arc<Exporter>,
    /// Upper bound for one `/metrics` or `/health` request.
    pub(crate) request_timeout: Duration,
    /// Cancelled when the process starts shutting down.
    pub(crate) shutdown: CancellationToken,
}

impl AppState {
    pub(crate) fn new(exporter: Arc<Exporter>, request_timeout: Duration) -> Self {
        Self {
            exporter,
            request_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token for one request: cancelled on shutdown or after the timeout.
    pub(crate) fn request_token(&self) -> CancellationToken {
        let token = self.shutdown.child_token();
        let timer = token.clone();
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => timer.cancel(),
            }
        });
        token
    }
}
