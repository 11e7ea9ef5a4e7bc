//! Background index loading.
//!
//! The index is built on a dedicated OS thread so the blocking work never
//! stalls the event loop. The built index is published through a `OnceLock`:
//! any reader that observes it set also observes the fully constructed index.

use crate::error::LoadError;
use crate::index::{CharIndex, IndexSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Status reported while the index is still being built.
pub const STATUS_LOADING: &str = "index still loading, try again shortly.";

/// Status reported when the index failed to load.
pub const STATUS_UNAVAILABLE: &str = "index unavailable";

/// Result lines and status for a single query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub lines: Vec<String>,
    pub status: String,
}

impl QueryResult {
    fn status_only(status: &str) -> Self {
        QueryResult {
            lines: Vec::new(),
            status: status.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    index: OnceLock<CharIndex>,
    failed: AtomicBool,
}

/// Shared, read-mostly handle to the index.
///
/// Cloned into every connection handler. The index is written exactly once
/// by the loader and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct IndexHandle {
    shared: Arc<Shared>,
}

impl IndexHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the index has been published.
    pub fn is_ready(&self) -> bool {
        self.shared.index.get().is_some()
    }

    /// Whether the load failed. Once set, the index never becomes ready.
    pub fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Answer a query, or report why it can't be answered yet.
    pub fn lookup(&self, query: &str) -> QueryResult {
        match self.shared.index.get() {
            Some(index) => {
                let lines: Vec<String> = index.find_matches(query).collect();
                let status = index.status_line(query, lines.len());
                QueryResult { lines, status }
            }
            None if self.is_failed() => QueryResult::status_only(STATUS_UNAVAILABLE),
            None => QueryResult::status_only(STATUS_LOADING),
        }
    }

    pub(crate) fn publish(&self, index: CharIndex) -> bool {
        self.shared.index.set(index).is_ok()
    }

    pub(crate) fn mark_failed(&self) {
        self.shared.failed.store(true, Ordering::Release);
    }
}

/// How a load ended, reported by [`DeferredLoader::join`].
#[derive(Debug)]
pub enum LoadOutcome {
    Ready { elapsed: Duration },
    Failed(LoadError),
}

/// Handle to the background loader thread.
pub struct DeferredLoader {
    thread: JoinHandle<LoadOutcome>,
}

impl DeferredLoader {
    /// Start building the index on its own thread and return immediately.
    ///
    /// `warmup` is slept after the build and before publication. `on_ready`
    /// runs on the loader thread once the index is visible to readers; it is
    /// not called if the load fails.
    pub fn start<F>(
        handle: IndexHandle,
        source: IndexSource,
        warmup: Duration,
        on_ready: F,
    ) -> std::io::Result<Self>
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        info!(source = ?source, "Loading index");
        Self::spawn(handle, move || source.build(), warmup, on_ready)
    }

    fn spawn<B, F>(
        handle: IndexHandle,
        build: B,
        warmup: Duration,
        on_ready: F,
    ) -> std::io::Result<Self>
    where
        B: FnOnce() -> Result<CharIndex, LoadError> + Send + 'static,
        F: FnOnce(Duration) + Send + 'static,
    {
        let thread = thread::Builder::new()
            .name("index-loader".to_string())
            .spawn(move || {
                let _guard = UnwindGuard(&handle);
                let started = Instant::now();

                let index = match build() {
                    Ok(index) => index,
                    Err(e) => {
                        error!(error = %e, "Index load failed; queries will report unavailable");
                        handle.mark_failed();
                        return LoadOutcome::Failed(e);
                    }
                };

                if !warmup.is_zero() {
                    thread::sleep(warmup);
                }

                handle.publish(index);
                let elapsed = started.elapsed();
                on_ready(elapsed);
                LoadOutcome::Ready { elapsed }
            })?;

        Ok(DeferredLoader { thread })
    }

    /// Wait for the loader thread without blocking the runtime.
    ///
    /// Returns once the load has either completed or failed. A panic on the
    /// loader thread is reported as [`LoadError::Panicked`].
    pub async fn join(self, handle: &IndexHandle) -> LoadOutcome {
        let joined = tokio::task::spawn_blocking(move || self.thread.join()).await;
        match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => {
                error!("Index loader thread panicked");
                handle.mark_failed();
                LoadOutcome::Failed(LoadError::Panicked)
            }
        }
    }
}

/// Marks the index failed if the loader thread unwinds before publishing,
/// so readers stop seeing "still loading" as soon as the thread dies.
struct UnwindGuard<'a>(&'a IndexHandle);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() && !self.0.is_ready() {
            error!("Index loader panicked; queries will report unavailable");
            self.0.mark_failed();
        }
    }
}
