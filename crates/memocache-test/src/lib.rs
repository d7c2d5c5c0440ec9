//! Helpers for testing the memoization engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let _dir = test::tempdir()`).
//!
//!  - Timing based assertions should use [`timed`] and compare against generous bounds, the
//!    test runner may be arbitrarily slow.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memocache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memocache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Parses a human readable duration like `20ms`.
///
/// # Panics
///
/// Panics if the duration cannot be parsed.
pub fn duration(s: &str) -> Duration {
    humantime::parse_duration(s).unwrap()
}

/// Awaits the given future and returns its output along with the elapsed wall clock time.
pub async fn timed<F: Future>(future: F) -> (F::Output, Duration) {
    let start = Instant::now();
    let output = future.await;
    (output, start.elapsed())
}

/// Sleeps for a short while so that spawned background work (such as cache writes) can settle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Counts how often a test function was invoked, per label.
///
/// Clones share the same counters, so a clone can be moved into the function under test while
/// the test body keeps inspecting the original.
#[derive(Clone, Debug, Default)]
pub struct CallCounter {
    calls: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one call for `label`.
    pub fn hit(&self, label: impl Into<String>) {
        let mut calls = self.calls.lock().unwrap();
        *calls.entry(label.into()).or_default() += 1;
    }

    /// Returns the number of calls recorded for `label`.
    pub fn calls(&self, label: &str) -> usize {
        self.calls.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    /// Returns the total number of calls across all labels.
    pub fn total(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Returns all recorded calls, sorted by label.
    pub fn all_calls(&self) -> Vec<(String, usize)> {
        let map = self.calls.lock().unwrap();
        map.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}
