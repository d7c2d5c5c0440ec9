use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use memocache::{CacheStore, Config, MemoryStore, Memoizer, ResultTuple, StoreError, Value};
use memocache_test as test;

pub use test::CallCounter;

/// A [`CacheStore`] which records all traffic, and can be made slow or broken.
#[derive(Debug, Default)]
pub struct TestStore {
    inner: MemoryStore,
    down: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_delay_ms: AtomicU64,
    reads: AtomicUsize,
    writes: AtomicUsize,
    written_keys: Mutex<Vec<String>>,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ready(&self, ready: bool) {
        self.down.store(!ready, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The number of reads which reached the store.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The number of writes which reached the store, including failed ones.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// All keys successfully written so far, in order.
    pub fn written_keys(&self) -> Vec<String> {
        self.written_keys.lock().unwrap().clone()
    }

    /// Returns the raw payload stored under `key`, bypassing all instrumentation.
    pub async fn raw(&self, key: &str) -> Option<Bytes> {
        self.inner.get_raw(key).await.unwrap()
    }

    /// Replaces the payload stored under `key`, bypassing all instrumentation.
    pub async fn overwrite(&self, key: &str, payload: &'static [u8]) {
        self.inner
            .set_with_ttl(key, Duration::from_secs(60), Bytes::from_static(payload))
            .await
            .unwrap();
    }
}

#[async_trait]
impl CacheStore for TestStore {
    fn is_ready(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }

    async fn get_raw(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("connection reset by peer").into());
        }
        self.inner.get_raw(key).await
    }

    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: Bytes) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("out of memory").into());
        }
        self.written_keys.lock().unwrap().push(key.to_owned());
        self.inner.set_with_ttl(key, ttl, value).await
    }
}

/// Sets up logging and creates a [`Memoizer`] backed by `store`.
///
/// The `update_config` closure can modify any default configuration if needed.
pub fn setup_memoizer(store: &Arc<TestStore>, update_config: impl FnOnce(&mut Config)) -> Memoizer {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let handle = tokio::runtime::Handle::current();
    Memoizer::new(&config, store.clone(), handle)
}

/// A test function which returns its arguments after `delay`, counting its invocations.
pub fn echo(
    counter: &CallCounter,
    delay: Duration,
) -> impl Fn(Vec<Value>) -> BoxFuture<'static, ResultTuple> + Send + Sync + 'static {
    let counter = counter.clone();
    move |args| {
        counter.hit("echo");
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ResultTuple::ok(args)
        })
    }
}
