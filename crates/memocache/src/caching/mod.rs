//! # Memocache caching infrastructure
//!
//! This module holds everything the [`Memoizer`](crate::Memoizer) uses to turn a call into a
//! stored result and back again. The engine itself only strings these pieces together.
//!
//! ## Cache Keys
//!
//! Every stored result lives under a [`CacheKey`], which is made up of three parts:
//!
//! - A [`KeyNamespace`], consisting of the configured `key_namespace` and optionally a
//!   `memoize_key_namespace`. Changing the latter, for example on every deploy, invalidates all
//!   results stored before.
//! - A [`FunctionKey`], which is generated randomly whenever a function is wrapped, unless a name
//!   is given explicitly.
//! - An [`ArgsHash`], a SHA-256 fingerprint of the canonical serialization of the arguments.
//!
//! ## Storage Format
//!
//! Results are serialized by the [`codec`] into a JSON array which keeps dates and errors intact,
//! and then [compressed](compression) once they reach the configured `compression_threshold`.
//! Compressed payloads carry a marker prefix, so a reader never needs to know which threshold
//! the writer was using.
//!
//! ## The Store
//!
//! The store is reached through the [`CacheStore`] trait, and every store access goes through the
//! [`StoreService`]:
//!
//! - Reads are raced against a timeout by [`race_lookup`]. A slow store is never waited on for
//!   longer than the lookup budget, and a store which is not ready is not waited on at all.
//! - Writes are fire-and-forget. They go through a bounded queue, with a limited number of
//!   concurrent writes. Writes which do not fit into the queue are dropped.
//!
//! No store failure is ever surfaced to callers of a memoized function. Failed reads, timeouts and
//! undecodable payloads are all cache misses, and failed writes are logged and forgotten.
//!
//! ## Request Coalescing
//!
//! While a result is being computed, further callers with the same arguments are queued up in
//! [`InFlight`] instead of starting their own computation. They are resolved in order, with the
//! very same result, once the computation finishes.
//!
//! ### Metrics
//!
//! Here is a list of the metrics that are collected:
//!
//! - `memoize.access`: All calls of a memoized function.
//! - `memoize.hit`: Calls served from the store.
//! - `memoize.computation`: Actual computations being run.
//! - `memoize.decode_error`: Stored payloads which could not be decoded.
//! - `lookup.timeout`: Lookups which ran out of their budget.
//! - `in_flight.queued`: Calls queued behind a running computation.
//! - `store.fetch`: Store reads, tagged by `status`.
//! - `store.write`: Store writes, tagged by `status`.
//! - `store.write.discarded`: Writes which were dropped, tagged by `reason`.
//! - `compression`: Encoded payloads, tagged by compression `type`.

mod cache_key;
pub mod codec;
pub mod compression;
mod in_flight;
mod lookup;
mod store;
mod ttl;

pub use cache_key::{ArgsHash, CacheKey, FunctionKey, KeyNamespace};
pub use codec::DecodeError;
pub use in_flight::{Continuation, InFlight, Interrupted, Join};
pub use lookup::{LookupError, race_lookup};
pub use store::{CacheStore, MemoryStore, StoreError, StoreService};
pub use ttl::Ttl;
