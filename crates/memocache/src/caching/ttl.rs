use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::types::ResultTuple;

/// How long a computed result is kept in the store.
///
/// A TTL of zero means the result is not stored at all.
#[derive(Clone)]
pub enum Ttl {
    /// The same time-to-live for every result.
    Fixed(Duration),
    /// A time-to-live derived from each result.
    Computed(Arc<dyn Fn(&ResultTuple) -> Duration + Send + Sync>),
}

impl Ttl {
    /// Creates a [`Ttl::Computed`] from a function of the result.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&ResultTuple) -> Duration + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// Returns the time-to-live for `result`.
    pub fn resolve(&self, result: &ResultTuple) -> Duration {
        match self {
            Self::Fixed(ttl) => *ttl,
            Self::Computed(f) => f(result),
        }
    }

    /// Returns how long a lookup may take before it is abandoned.
    ///
    /// There is no point in waiting for the store longer than a fixed TTL, as the result would
    /// have expired by then anyway. A computed TTL is not known before the result is, so it does
    /// not shorten the lookup.
    pub fn lookup_budget(&self, lookup_timeout: Duration) -> Duration {
        match self {
            Self::Fixed(ttl) => lookup_timeout.min(*ttl),
            Self::Computed(_) => lookup_timeout,
        }
    }
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(ttl) => f.debug_tuple("Fixed").field(ttl).finish(),
            Self::Computed(_) => f.debug_tuple("Computed").finish_non_exhaustive(),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(ttl: Duration) -> Self {
        Self::Fixed(ttl)
    }
}
