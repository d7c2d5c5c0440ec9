use std::time::Duration;

use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use thiserror::Error;

use super::store::{StoreError, StoreService};
use super::CacheKey;

/// Reasons a lookup did not produce a cached payload.
///
/// The memoization engine treats all of these as a cache miss.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The store did not answer within the lookup budget.
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The read task was torn down before it completed.
    #[error("lookup was interrupted")]
    Interrupted,
}

/// Reads `key` from the store, giving up after `budget`.
///
/// The read runs as its own task. When the budget runs out first, that task is detached rather
/// than cancelled: the store still gets to finish the read, but its result is dropped on the
/// floor and never reaches the caller.
///
/// A store that is not ready is not waited on at all.
pub async fn race_lookup(
    store: &StoreService,
    key: &CacheKey,
    budget: Duration,
) -> Result<Option<Bytes>, LookupError> {
    if !store.is_ready() {
        return Err(StoreError::NotConnected.into());
    }
    if budget.is_zero() {
        return Err(LookupError::Timeout(budget));
    }

    let read = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(
            async move { store.fetch(&key).await }.bind_hub(Hub::new_from_top(Hub::current())),
        )
    };

    match tokio::time::timeout(budget, read).await {
        Ok(Ok(res)) => Ok(res?),
        Ok(Err(_join_error)) => Err(LookupError::Interrupted),
        Err(_elapsed) => {
            metric!(counter("lookup.timeout") += 1);
            tracing::debug!(%key, ?budget, "Cache lookup timed out");
            Err(LookupError::Timeout(budget))
        }
    }
}
