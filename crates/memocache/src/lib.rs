#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod memoize;
pub mod types;
pub mod utils;

pub use caching::{
    CacheKey, CacheStore, DecodeError, FunctionKey, LookupError, MemoryStore, StoreError, Ttl,
};
pub use config::Config;
pub use memoize::{
    Arg, Callback, MemoizeError, Memoized, Memoizer, WrapOptions, interrupted_result,
};
pub use types::{ErrorValue, ResultTuple, Value};
