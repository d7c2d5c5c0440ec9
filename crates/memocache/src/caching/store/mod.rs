//! The interface to the external cache store.
//!
//! The store itself (a Redis server, memcached, ...) is not part of this crate. Anything that can
//! get bytes, set bytes with a time-to-live, and tell whether it is currently connected can be
//! plugged in by implementing [`CacheStore`]. An in-process [`MemoryStore`] is provided as well.
//!
//! The [`StoreService`] sits in front of a [`CacheStore`] and takes care of the policies the
//! memoization engine relies on: a store that is not ready is never talked to, and writes are
//! fire-and-forget, go through a bounded queue, and are simply dropped when that queue is full.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::config::WriteQueueConfig;

use super::CacheKey;

mod memory;

pub use memory::MemoryStore;

/// Errors talking to the cache store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The store reported that it is not ready, no I/O was attempted.
    #[error("cache store is not connected")]
    NotConnected,
    /// The store failed to serve the request.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A key-value store memoized results are kept in.
#[async_trait]
pub trait CacheStore: fmt::Debug + Send + Sync + 'static {
    /// Returns whether the store is currently connected.
    ///
    /// This must not block. The engine never waits for a store to become ready.
    fn is_ready(&self) -> bool;

    /// Fetches the raw bytes stored under `key`, if any.
    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Stores `value` under `key`, to expire after `ttl`.
    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: Bytes) -> Result<(), StoreError>;
}

/// Message to send write tasks across the [`StoreService::write_queue_tx`].
#[derive(Debug)]
struct WriteMessage {
    key: String,
    ttl: Duration,
    content: Bytes,
    /// A channel to notify completion of the write.
    done_tx: oneshot::Sender<()>,
}

/// The result of an attempt to write an entry to the store.
#[derive(Debug, Clone, Copy)]
enum StoreWriteResult {
    Written(u64),
    /// The store was not ready when the write was about to happen.
    Skipped,
}

impl AsRef<str> for StoreWriteResult {
    fn as_ref(&self) -> &str {
        match self {
            StoreWriteResult::Written(_) => "written",
            StoreWriteResult::Skipped => "skipped",
        }
    }
}

/// The gate between the memoization engine and a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreService {
    backend: Arc<dyn CacheStore>,
    write_queue_tx: mpsc::Sender<WriteMessage>,
}

impl StoreService {
    /// Creates the service and spawns its write worker onto `runtime`.
    pub fn new(
        backend: Arc<dyn CacheStore>,
        config: &WriteQueueConfig,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.max_write_queue_size.max(1));
        runtime.spawn(
            Self::write_worker(rx, backend.clone(), config.max_concurrent_writes.max(1))
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
        Self {
            backend,
            write_queue_tx: tx,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_ready()
    }

    /// Long running task managing concurrent writes to the store.
    async fn write_worker(
        mut work_rx: mpsc::Receiver<WriteMessage>,
        backend: Arc<dyn CacheStore>,
        max_concurrent_writes: usize,
    ) {
        let (done_tx, mut done_rx) = mpsc::channel::<()>(max_concurrent_writes);
        let mut writes_counter = max_concurrent_writes;
        loop {
            tokio::select! {
                Some(message) = work_rx.recv(), if writes_counter > 0 => {
                    writes_counter -= 1;
                    tokio::spawn(
                        Self::guarded_writer(done_tx.clone(), backend.clone(), message)
                            .bind_hub(Hub::new_from_top(Hub::current()))
                    );
                    let writes_in_flight = (max_concurrent_writes - writes_counter) as u64;
                    metric!(gauge("store.writes_in_flight") = writes_in_flight);
                }
                Some(_) = done_rx.recv() => {
                    writes_counter += 1;
                }
                else => break,
            }
        }
        tracing::debug!("Cache store write worker terminated");
    }

    /// Runs [`Self::single_writer`] in its own task and frees up its slot once it is done.
    ///
    /// The slot is given back even if the store panics during the write.
    async fn guarded_writer(
        done_tx: mpsc::Sender<()>,
        backend: Arc<dyn CacheStore>,
        message: WriteMessage,
    ) {
        let writer = tokio::spawn(
            Self::single_writer(backend, message).bind_hub(Hub::new_from_top(Hub::current())),
        );
        if let Err(err) = writer.await {
            metric!(
                counter("store.write") += 1,
                "status" => "error",
                "errdetails" => "panic",
            );
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, "Cache store write did not complete");
        }

        // Tell the work coordinator we're done.
        done_tx.send(()).await.unwrap_or_else(|err| {
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, "Cache store writer failed to send done message");
        });
    }

    /// Does a single write to the store.
    ///
    /// Handles metrics and error reporting, errors never reach the caller.
    async fn single_writer(backend: Arc<dyn CacheStore>, message: WriteMessage) {
        let WriteMessage {
            key,
            ttl,
            content,
            done_tx: complete_tx,
        } = message;

        let res = if backend.is_ready() {
            let bytes = content.len() as u64;
            backend
                .set_with_ttl(&key, ttl, content)
                .await
                .map(|()| StoreWriteResult::Written(bytes))
        } else {
            Ok(StoreWriteResult::Skipped)
        };

        match res {
            Ok(op) => {
                tracing::trace!(%key, write = op.as_ref(), "Finished cache store write");
                metric!(
                    counter("store.write") += 1,
                    "write" => op.as_ref(),
                    "status" => "ok",
                );
                if let StoreWriteResult::Written(bytes) = op {
                    metric!(time_raw("store.write.size") = bytes);
                }
            }
            Err(err) => {
                let errdetails = match err {
                    StoreError::NotConnected => "not-connected",
                    StoreError::Other(_) => "other",
                };
                if let StoreError::Other(ref err) = err {
                    let stderr: &dyn std::error::Error = &**err;
                    tracing::error!(stderr, %key, "Error writing to cache store");
                }
                metric!(
                    counter("store.write") += 1,
                    "status" => "error",
                    "errdetails" => errdetails,
                );
            }
        }

        // Tell the original work submitter we're done, if they dropped this we don't care.
        complete_tx.send(()).ok();
    }

    /// Fetches the raw bytes stored under `key`.
    ///
    /// Fails right away with [`StoreError::NotConnected`] if the store is not ready.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Option<Bytes>, StoreError> {
        if !self.backend.is_ready() {
            metric!(counter("store.fetch") += 1, "status" => "not-connected");
            return Err(StoreError::NotConnected);
        }
        let res = self.backend.get_raw(&key.to_string()).await;
        let status = match res {
            Ok(Some(_)) => "hit",
            Ok(None) => "miss",
            Err(_) => "error",
        };
        metric!(counter("store.fetch") += 1, "status" => status);
        res
    }

    /// Queues `content` to be stored under `key`.
    ///
    /// Errors are transparently hidden, this service handles any errors itself.
    ///
    /// # Return
    ///
    /// A [`oneshot::Receiver`] is returned which will receive a value once the write has
    /// finished. If the store is not ready, or the write queue is full, the write is discarded
    /// and the corresponding [`oneshot::Sender`] is dropped, so awaiting the receiver resolves
    /// into an [`Err`].
    ///
    /// This [`oneshot::Receiver`] can also be safely ignored if you do not need to know when the
    /// write happened.
    pub fn store(&self, key: &CacheKey, ttl: Duration, content: Bytes) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        if !self.backend.is_ready() {
            metric!(counter("store.write.discarded") += 1, "reason" => "not-connected");
            tracing::debug!(%key, "Cache store not connected, discarding write");
            return done_rx;
        }
        metric!(gauge("store.write_queue_capacity") = self.write_queue_tx.capacity() as u64);
        self.write_queue_tx
            .try_send(WriteMessage {
                key: key.to_string(),
                ttl,
                content,
                done_tx,
            })
            .unwrap_or_else(|_| {
                metric!(counter("store.write.discarded") += 1, "reason" => "queue-full");
                tracing::error!("Cache store write queue full");
            });
        done_rx
    }
}
