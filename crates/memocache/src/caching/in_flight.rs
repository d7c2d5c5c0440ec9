//! Suppression of concurrent computations for the same arguments.
//!
//! Every argument fingerprint is either idle, with no entry in the map, or computing, with an
//! entry holding the queue of everyone waiting for the result. The first caller to [`join`] an
//! idle fingerprint starts the computation, everyone after that is queued behind it. Once the
//! computation finishes, [`complete`] resolves the whole queue and the fingerprint goes back to
//! idle. A computation that goes away without a result is [`abandon`]ed, which resolves the queue
//! with [`Interrupted`].
//!
//! [`join`]: InFlight::join
//! [`complete`]: InFlight::complete
//! [`abandon`]: InFlight::abandon

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::types::ResultTuple;

use super::ArgsHash;

/// The computation a caller was waiting for ended without a result.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("computation was interrupted")]
pub struct Interrupted;

/// A caller waiting for a result.
pub type Continuation = Box<dyn FnOnce(Result<ResultTuple, Interrupted>) + Send>;

/// Whether [`InFlight::join`] started a new computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Join {
    /// The caller is the first one, and is responsible for running the computation.
    Started,
    /// A computation is already running, the caller has been queued behind it.
    Queued,
}

/// The set of computations currently running for one memoized function.
#[derive(Default)]
pub struct InFlight {
    computations: Mutex<HashMap<ArgsHash, Vec<Continuation>>>,
}

impl InFlight {
    /// Queues `continuation` for the computation of `hash`.
    pub fn join(&self, hash: &ArgsHash, continuation: Continuation) -> Join {
        let mut computations = self.computations.lock();
        match computations.get_mut(hash) {
            Some(queue) => {
                queue.push(continuation);
                metric!(counter("in_flight.queued") += 1);
                Join::Queued
            }
            None => {
                computations.insert(hash.clone(), vec![continuation]);
                metric!(gauge("in_flight.computations") = computations.len() as u64);
                Join::Started
            }
        }
    }

    /// Ends the computation of `hash`, handing `result` to everyone waiting for it in the order
    /// they joined. Returns how many there were.
    ///
    /// Anyone joining after this starts a new computation.
    pub fn complete(&self, hash: &ArgsHash, result: &ResultTuple) -> usize {
        self.resolve(hash, || Ok(result.clone()))
    }

    /// Ends the computation of `hash` without a result.
    ///
    /// Everyone waiting for it receives [`Interrupted`]. Returns how many there were.
    pub fn abandon(&self, hash: &ArgsHash) -> usize {
        let abandoned = self.resolve(hash, || Err(Interrupted));
        if abandoned > 0 {
            tracing::error!(%hash, abandoned, "Memoized computation did not complete");
        }
        abandoned
    }

    fn resolve<F>(&self, hash: &ArgsHash, outcome: F) -> usize
    where
        F: Fn() -> Result<ResultTuple, Interrupted>,
    {
        // the lock must not be held while running continuations, they may join again
        let queue = self.computations.lock().remove(hash).unwrap_or_default();
        let resolved = queue.len();
        for continuation in queue {
            let outcome = outcome();
            if panic::catch_unwind(AssertUnwindSafe(move || continuation(outcome))).is_err() {
                metric!(counter("in_flight.continuation_panic") += 1);
                tracing::error!(%hash, "Continuation of memoized computation panicked");
            }
        }
        resolved
    }

    /// Returns the number of distinct computations currently running.
    pub fn len(&self) -> usize {
        self.computations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_computing(&self, hash: &ArgsHash) -> bool {
        self.computations.lock().contains_key(hash)
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("computations", &self.len())
            .finish()
    }
}
