//! The memoization engine.
//!
//! A [`Memoizer`] wraps asynchronous functions into [`Memoized`] handles. Calling a handle first
//! looks for a stored result of an earlier call with equal arguments, and only runs the function
//! if there is none. Concurrent calls with equal arguments share one run of the function.
//!
//! ```ignore
//! let memoizer = Memoizer::new(&config, Arc::new(MemoryStore::default()), Handle::current());
//! let add = memoizer.wrap(|args: Vec<Value>| async move {
//!     let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
//!     ResultTuple::ok([Value::from(sum)])
//! });
//!
//! let result = add.call(vec![1.into(), 2.into()]).await?;
//! ```

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::sync::oneshot;

use crate::caching::codec::{self, DecodeError};
use crate::caching::compression::{maybe_compress, maybe_decompress};
use crate::caching::{
    ArgsHash, CacheKey, CacheStore, Continuation, FunctionKey, InFlight, Interrupted, Join,
    KeyNamespace, LookupError, StoreError, StoreService, Ttl, race_lookup,
};
use crate::config::Config;
use crate::types::{ErrorValue, ResultTuple, Value};
use crate::utils::defer::defer;

/// The function behind a [`Memoized`] handle.
type ComputeFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, ResultTuple> + Send + Sync>;

/// Decides whether an error result may be stored.
type ErrorPredicate = Arc<dyn Fn(&ErrorValue) -> bool + Send + Sync>;

/// A callback receiving the result of a call made through [`Memoized::invoke`].
///
/// If the computation is interrupted, the callback receives an error result named `Interrupted`
/// instead, see [`interrupted_result`].
pub type Callback = Box<dyn FnOnce(ResultTuple) + Send>;

/// Errors surfaced to callers of a [`Memoized`] function.
///
/// Errors of the cache itself are never surfaced, the function is run directly instead. Errors
/// produced by the function are part of its [`ResultTuple`].
#[derive(thiserror::Error, Debug)]
pub enum MemoizeError {
    /// The function was called the wrong way, it has not been run.
    #[error("invalid usage: {0}")]
    InvalidUsage(&'static str),
    /// The computation went away without producing a result, most likely because it panicked.
    #[error("computation was interrupted")]
    Interrupted,
}

impl From<Interrupted> for MemoizeError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// The result handed to [`Callback`]s whose computation went away without a result.
///
/// This is never stored.
pub fn interrupted_result() -> ResultTuple {
    ResultTuple::err(ErrorValue::new("computation was interrupted").with_name("Interrupted"))
}

/// An argument of a call through [`Memoized::invoke`].
pub enum Arg {
    Value(Value),
    Callback(Callback),
}

impl Arg {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(ResultTuple) + Send + 'static,
    {
        Self::Callback(Box::new(f))
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Callback(_) => f.debug_tuple("Callback").finish_non_exhaustive(),
        }
    }
}

/// Options for [`Memoizer::wrap_with`].
#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    /// How long results are stored. Defaults to the configured `default_ttl`.
    pub ttl: Option<Ttl>,
    /// The identity of the wrapped function. Defaults to a random one.
    pub function_key: Option<FunctionKey>,
}

impl WrapOptions {
    pub fn ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    /// Uses a deterministic identity derived from `name`, see [`FunctionKey::from_name`].
    pub fn named(mut self, name: &str) -> Self {
        self.function_key = Some(FunctionKey::from_name(name));
        self
    }
}

/// State shared by all functions wrapped by one [`Memoizer`].
struct Engine {
    store: StoreService,
    namespace: KeyNamespace,
    lookup_timeout: Duration,
    default_ttl: Duration,
    compression_threshold: usize,
    time_label_prefix: Option<String>,
    runtime: tokio::runtime::Handle,
}

impl Engine {
    fn report_time(&self, what: &str, key: &CacheKey, elapsed: Duration) {
        if let Some(ref prefix) = self.time_label_prefix {
            let label = format!("{prefix}.{what}");
            metric!(timer(&label) = elapsed);
            tracing::debug!(%key, %label, ?elapsed, "Memoize timing");
        }
    }
}

/// Creates memoized functions sharing one cache store.
pub struct Memoizer {
    engine: Arc<Engine>,
    errors_when: ErrorPredicate,
}

impl Memoizer {
    /// Creates a new memoizer storing results in `store`.
    ///
    /// Store writes and computations are spawned onto `runtime`.
    pub fn new(
        config: &Config,
        store: Arc<dyn CacheStore>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let store = StoreService::new(store, &config.writes, &runtime);
        let engine = Engine {
            store,
            namespace: KeyNamespace::new(
                &config.key_namespace,
                config.memoize_key_namespace.as_deref(),
            ),
            lookup_timeout: config.lookup_timeout,
            default_ttl: config.default_ttl,
            compression_threshold: config.compression_threshold,
            time_label_prefix: config.time_label_prefix.clone(),
            runtime,
        };
        Self {
            engine: Arc::new(engine),
            errors_when: Arc::new(|_: &ErrorValue| true),
        }
    }

    /// Only stores error results for which `predicate` returns `true`.
    ///
    /// By default, all error results are stored. Rejected errors are still handed to all callers,
    /// they are just computed again on the next call.
    ///
    /// This only affects functions wrapped afterwards.
    pub fn errors_when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ErrorValue) -> bool + Send + Sync + 'static,
    {
        self.errors_when = Arc::new(predicate);
        self
    }

    /// Wraps `f` with the default options.
    pub fn wrap<F, Fut>(&self, f: F) -> Memoized
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResultTuple> + Send + 'static,
    {
        self.wrap_with(f, WrapOptions::default())
    }

    /// Wraps `f`.
    ///
    /// Every call to this creates an independent memoized function, unless a name is given in
    /// the `options`.
    pub fn wrap_with<F, Fut>(&self, f: F, options: WrapOptions) -> Memoized
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResultTuple> + Send + 'static,
    {
        let function: ComputeFn = Arc::new(move |args| f(args).boxed());
        let inner = Inner {
            engine: Arc::clone(&self.engine),
            function,
            function_key: options.function_key.unwrap_or_else(FunctionKey::random),
            errors_when: Arc::clone(&self.errors_when),
            ttl: options
                .ttl
                .unwrap_or(Ttl::Fixed(self.engine.default_ttl)),
            in_flight: InFlight::default(),
        };
        Memoized {
            inner: Arc::new(inner),
        }
    }
}

impl fmt::Debug for Memoizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoizer")
            .field("namespace", &self.engine.namespace)
            .field("lookup_timeout", &self.engine.lookup_timeout)
            .field("default_ttl", &self.engine.default_ttl)
            .finish_non_exhaustive()
    }
}

/// A memoized function.
///
/// Cloning the handle yields the same function, sharing its cache entries and its running
/// computations.
#[derive(Clone)]
pub struct Memoized {
    inner: Arc<Inner>,
}

impl Memoized {
    /// Calls the function with `args`, resolving with its result.
    pub async fn call(&self, args: Vec<Value>) -> Result<ResultTuple, MemoizeError> {
        let (tx, rx) = oneshot::channel();
        let continuation: Continuation = Box::new(move |result| {
            tx.send(result).ok();
        });
        Arc::clone(&self.inner).run(args, continuation).await;
        let result = rx.await.map_err(|_| MemoizeError::Interrupted)??;
        Ok(result)
    }

    /// Calls the function with `args`, of which the last one must be an [`Arg::Callback`].
    ///
    /// The callback receives the result, this returns right away. An error is only returned if
    /// the arguments are unusable, in which case the function is not run at all.
    pub fn invoke(&self, mut args: Vec<Arg>) -> Result<(), MemoizeError> {
        let Some(Arg::Callback(callback)) = args.pop() else {
            return Err(MemoizeError::InvalidUsage(
                "the last argument must be a callback",
            ));
        };
        let args = args
            .into_iter()
            .map(|arg| match arg {
                Arg::Value(value) => Ok(value),
                Arg::Callback(_) => Err(MemoizeError::InvalidUsage(
                    "only the last argument may be a callback",
                )),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let continuation: Continuation =
            Box::new(move |result| callback(result.unwrap_or_else(|_| interrupted_result())));
        let inner = Arc::clone(&self.inner);
        self.inner
            .engine
            .runtime
            .spawn(inner.run(args, continuation).bind_hub(Hub::new_from_top(Hub::current())));
        Ok(())
    }

    pub fn function_key(&self) -> &FunctionKey {
        &self.inner.function_key
    }

    /// Returns the number of distinct argument lists currently being computed.
    pub fn computations_in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }
}

impl fmt::Debug for Memoized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("function_key", &self.inner.function_key)
            .field("ttl", &self.inner.ttl)
            .field("in_flight", &self.inner.in_flight)
            .finish_non_exhaustive()
    }
}

struct Inner {
    engine: Arc<Engine>,
    function: ComputeFn,
    function_key: FunctionKey,
    errors_when: ErrorPredicate,
    ttl: Ttl,
    in_flight: InFlight,
}

impl Inner {
    /// Serves one call, handing the result to `continuation` exactly once.
    async fn run(self: Arc<Self>, args: Vec<Value>, continuation: Continuation) {
        metric!(counter("memoize.access") += 1);
        let hash = ArgsHash::from_args(&args);
        let key = CacheKey::new(&self.engine.namespace, &self.function_key, hash.clone());

        if let Some(result) = self.lookup(&key).await {
            metric!(counter("memoize.hit") += 1);
            tracing::trace!(%key, "Serving memoized result");
            continuation(Ok(result));
            return;
        }

        match self.in_flight.join(&hash, continuation) {
            Join::Queued => {
                tracing::trace!(%key, "Waiting for running computation");
            }
            Join::Started => {
                let inner = Arc::clone(&self);
                self.engine.runtime.spawn(
                    inner
                        .compute(key, args)
                        .bind_hub(Hub::new_from_top(Hub::current())),
                );
            }
        }
    }

    /// Looks up a stored result, any failure along the way is a miss.
    async fn lookup(&self, key: &CacheKey) -> Option<ResultTuple> {
        let budget = self.ttl.lookup_budget(self.engine.lookup_timeout);
        let start = Instant::now();
        let res = race_lookup(&self.engine.store, key, budget).await;
        self.engine.report_time("lookup", key, start.elapsed());

        let payload = match res {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(LookupError::Store(StoreError::Other(err))) => {
                let stderr: &dyn std::error::Error = &*err;
                tracing::error!(stderr, %key, "Error reading from cache store");
                return None;
            }
            Err(err) => {
                tracing::debug!(%key, error = %err, "Cache lookup failed");
                return None;
            }
        };

        match decode_payload(&payload) {
            Ok(result) => Some(result),
            Err(err) => {
                metric!(counter("memoize.decode_error") += 1);
                let stderr: &dyn std::error::Error = &err;
                tracing::warn!(stderr, %key, "Discarding undecodable cached result");
                None
            }
        }
    }

    /// Runs the function and resolves everyone waiting for it.
    async fn compute(self: Arc<Self>, key: CacheKey, args: Vec<Value>) {
        metric!(counter("memoize.computation") += 1);
        let hash = key.args_hash().clone();

        // An interrupted computation must not leave the entry behind, or nobody could ever
        // compute these arguments again.
        let guard = {
            let inner = Arc::clone(&self);
            let hash = hash.clone();
            defer(move || {
                inner.in_flight.abandon(&hash);
            })
        };

        let start = Instant::now();
        let function = Arc::clone(&self.function);
        let result = match AssertUnwindSafe(async move { function(args).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                metric!(counter("memoize.panic") += 1);
                tracing::error!(%key, "Memoized function panicked");
                // dropping the guard resolves everyone waiting
                return;
            }
        };
        self.engine.report_time("compute", &key, start.elapsed());

        self.persist(&key, &result);

        guard.disarm();
        self.in_flight.complete(&hash, &result);
    }

    /// Queues `result` to be stored, if the policies allow it.
    fn persist(&self, key: &CacheKey, result: &ResultTuple) {
        let ttl = self.ttl.resolve(result);
        if ttl.is_zero() {
            tracing::trace!(%key, "Not storing result with zero TTL");
            return;
        }
        if let Some(error) = result.error() {
            if !(self.errors_when)(error) {
                tracing::trace!(%key, %error, "Not storing rejected error result");
                return;
            }
        }

        let payload = match maybe_compress(codec::encode(result), self.engine.compression_threshold)
        {
            Ok(payload) => payload,
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, %key, "Failed to compress result");
                return;
            }
        };
        // fire-and-forget, failures are handled by the store service
        let _ = self.engine.store.store(key, ttl, Bytes::from(payload));
    }
}

fn decode_payload(payload: &[u8]) -> Result<ResultTuple, DecodeError> {
    let payload = maybe_decompress(payload).map_err(DecodeError::Decompress)?;
    codec::decode(&payload)
}
