use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use memocache::{Arg, ResultTuple, Value, WrapOptions};
use memocache_test::settle;
use tokio::sync::oneshot;

use crate::{CallCounter, TestStore, echo, setup_memoizer};

#[tokio::test]
async fn test_concurrent_calls_share_one_computation() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap(echo(&counter, Duration::from_millis(50)));

    let calls = (0..10).map(|_| f.call(vec![Value::from("k")]));
    let results = join_all(calls).await;

    assert_eq!(counter.calls("echo"), 1);
    assert_eq!(results.len(), 10);
    let expected = ResultTuple::ok([Value::from("k")]);
    for result in results {
        assert_eq!(result.unwrap(), expected);
    }
    assert_eq!(f.computations_in_flight(), 0);

    settle().await;
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn test_concurrent_calls_without_store() {
    // coalescing does not depend on the store
    let store = TestStore::new();
    store.set_ready(false);
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap(echo(&counter, Duration::from_millis(50)));

    let calls = (0..5).map(|_| f.call(vec![Value::from(1)]));
    let results = join_all(calls).await;

    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(counter.calls("echo"), 1);
}

#[tokio::test]
async fn test_concurrent_calls_with_different_arguments() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap(echo(&counter, Duration::from_millis(50)));

    let calls = (0..6).map(|n| f.call(vec![Value::from(n % 3)]));
    let results = join_all(calls).await;

    assert_eq!(counter.total(), 3);
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), ResultTuple::ok([Value::from((n % 3) as i64)]));
    }
}

#[tokio::test]
async fn test_callbacks_are_resolved_in_order() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap_with(
        echo(&counter, Duration::from_millis(100)),
        WrapOptions::default().ttl(Duration::ZERO),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut receivers = Vec::new();
    for label in ["first", "second", "third"] {
        let (tx, rx) = oneshot::channel();
        let order = Arc::clone(&order);
        f.invoke(vec![
            Value::from("x").into(),
            Arg::callback(move |result| {
                order.lock().unwrap().push(label);
                tx.send(result).ok();
            }),
        ])
        .unwrap();
        receivers.push(rx);
        // make sure every caller is queued before the next one arrives
        settle().await;
    }

    let results: Vec<_> = join_all(receivers)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
    assert_eq!(counter.calls("echo"), 1);
    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_new_computation_after_completion() {
    // once a computation has resolved its callers, the next call starts afresh
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap_with(
        echo(&counter, Duration::from_millis(20)),
        WrapOptions::default().ttl(Duration::ZERO),
    );

    join_all((0..3).map(|_| f.call(vec![Value::Null]))).await;
    join_all((0..3).map(|_| f.call(vec![Value::Null]))).await;

    assert_eq!(counter.calls("echo"), 2);
}
