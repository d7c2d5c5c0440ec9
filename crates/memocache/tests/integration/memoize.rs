use std::time::Duration;

use chrono::{TimeZone, Utc};
use memocache::caching::compression::COMPRESSION_MARKER;
use memocache::{ErrorValue, ResultTuple, Ttl, Value, WrapOptions};
use memocache_test::{settle, timed};

use crate::{CallCounter, TestStore, echo, setup_memoizer};

#[tokio::test]
async fn test_second_call_is_immediate() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap(echo(&counter, Duration::from_millis(100)));

    let args = vec![Value::from("a"), Value::from("b")];
    let (first, first_time) = timed(f.call(args.clone())).await;
    settle().await;
    let (second, second_time) = timed(f.call(args)).await;

    let first = first.unwrap();
    assert_eq!(first.values(), [Value::Null, Value::from("a"), Value::from("b")]);
    assert_eq!(second.unwrap(), first);
    assert_eq!(counter.calls("echo"), 1);
    assert!(first_time >= Duration::from_millis(100));
    assert!(second_time < Duration::from_millis(100));
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn test_different_arguments_are_computed_separately() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap(echo(&counter, Duration::ZERO));

    f.call(vec![Value::from(1), Value::from(2)]).await.unwrap();
    settle().await;
    f.call(vec![Value::from(2), Value::from(1)]).await.unwrap();
    settle().await;
    f.call(vec![Value::from(1), Value::from(2)]).await.unwrap();

    assert_eq!(counter.calls("echo"), 2);
}

#[tokio::test]
async fn test_date_is_revived() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let date = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    let f = memoizer.wrap({
        let counter = counter.clone();
        move |_args: Vec<Value>| {
            counter.hit("now");
            async move { ResultTuple::ok([Value::from(date)]) }
        }
    });

    f.call(vec![]).await.unwrap();
    settle().await;
    let cached = f.call(vec![]).await.unwrap();

    assert_eq!(counter.calls("now"), 1);
    assert_eq!(cached.get(1).and_then(Value::as_date), Some(&date));
}

#[tokio::test]
async fn test_error_fields_survive() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap({
        let counter = counter.clone();
        move |args: Vec<Value>| {
            counter.hit("fail");
            async move {
                ResultTuple::err(
                    ErrorValue::new("record not found")
                        .with_name("NotFoundError")
                        .with_kind("ENOENT")
                        .with_stack("at lookup (db.rs:42)")
                        .with_arguments(args),
                )
            }
        }
    });

    let computed = f.call(vec![Value::from(7)]).await.unwrap();
    settle().await;
    let cached = f.call(vec![Value::from(7)]).await.unwrap();

    assert_eq!(counter.calls("fail"), 1);
    assert_eq!(cached, computed);
    let error = cached.error().unwrap();
    assert_eq!(error.message, "record not found");
    assert_eq!(error.name.as_deref(), Some("NotFoundError"));
    assert_eq!(error.kind.as_deref(), Some("ENOENT"));
    assert_eq!(error.stack.as_deref(), Some("at lookup (db.rs:42)"));
    assert_eq!(error.arguments, Some(Value::from(vec![Value::from(7)])));
}

#[tokio::test]
async fn test_ttl_expiry() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap_with(
        echo(&counter, Duration::ZERO),
        WrapOptions::default().ttl(Duration::from_millis(200)),
    );

    f.call(vec![Value::from(1)]).await.unwrap();
    settle().await;
    f.call(vec![Value::from(1)]).await.unwrap();
    assert_eq!(counter.calls("echo"), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    f.call(vec![Value::from(1)]).await.unwrap();
    assert_eq!(counter.calls("echo"), 2);
}

#[tokio::test]
async fn test_computed_ttl() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();

    // only results flagged as fresh are kept
    let ttl = Ttl::computed(|result: &ResultTuple| {
        if result.get(1) == Some(&Value::from("fresh")) {
            Duration::from_secs(60)
        } else {
            Duration::ZERO
        }
    });
    let f = memoizer.wrap_with(echo(&counter, Duration::ZERO), WrapOptions::default().ttl(ttl));

    for _ in 0..2 {
        f.call(vec![Value::from("stale")]).await.unwrap();
        settle().await;
        f.call(vec![Value::from("fresh")]).await.unwrap();
        settle().await;
    }

    assert_eq!(counter.calls("echo"), 3);
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn test_zero_ttl_is_never_stored() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ());
    let counter = CallCounter::new();
    let f = memoizer.wrap_with(
        echo(&counter, Duration::ZERO),
        WrapOptions::default().ttl(Duration::ZERO),
    );

    f.call(vec![Value::from(1)]).await.unwrap();
    settle().await;
    f.call(vec![Value::from(1)]).await.unwrap();

    assert_eq!(counter.calls("echo"), 2);
    assert_eq!(store.writes(), 0);
    assert_eq!(store.reads(), 0);
}

#[tokio::test]
async fn test_error_filter() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ())
        .errors_when(|error| error.kind.as_deref() != Some("E1"));
    let counter = CallCounter::new();
    let f = memoizer.wrap({
        let counter = counter.clone();
        move |args: Vec<Value>| {
            let kind = args[0].as_str().unwrap_or_default().to_owned();
            counter.hit(kind.clone());
            async move { ResultTuple::err(ErrorValue::new("failed").with_kind(kind)) }
        }
    });

    for _ in 0..2 {
        let e1 = f.call(vec![Value::from("E1")]).await.unwrap();
        assert_eq!(e1.error().unwrap().kind.as_deref(), Some("E1"));
        settle().await;

        let e2 = f.call(vec![Value::from("E2")]).await.unwrap();
        assert_eq!(e2.error().unwrap().kind.as_deref(), Some("E2"));
        settle().await;
    }

    // E1 is rejected and recomputed, E2 is frozen
    assert_eq!(
        counter.all_calls(),
        [("E1".to_owned(), 2), ("E2".to_owned(), 1)]
    );
}

#[tokio::test]
async fn test_large_results_are_compressed() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |config| config.compression_threshold = 100);
    let counter = CallCounter::new();
    let f = memoizer.wrap(echo(&counter, Duration::ZERO));

    let small = vec![Value::from("x")];
    let large = vec![Value::from("x".repeat(1000))];
    f.call(small.clone()).await.unwrap();
    f.call(large.clone()).await.unwrap();
    settle().await;

    let keys = store.written_keys();
    assert_eq!(keys.len(), 2);
    let mut payloads = Vec::new();
    for key in &keys {
        payloads.push(store.raw(key).await.unwrap());
    }
    let compressed = payloads
        .iter()
        .filter(|payload| payload.starts_with(COMPRESSION_MARKER))
        .count();
    assert_eq!(compressed, 1);

    // both are served from the store
    let cached = f.call(large).await.unwrap();
    assert_eq!(cached.get(1).and_then(Value::as_str).map(str::len), Some(1000));
    assert_eq!(f.call(small).await.unwrap().get(1), Some(&Value::from("x")));
    assert_eq!(counter.calls("echo"), 2);
}

#[tokio::test]
async fn test_key_namespaces() {
    let store = TestStore::new();
    let counter = CallCounter::new();
    let options = WrapOptions::default().named("shared");

    let first = setup_memoizer(&store, |config| {
        config.memoize_key_namespace = Some("deploy-1".into());
        config.time_label_prefix = Some("test".into());
    });
    let second = setup_memoizer(&store, |config| {
        config.memoize_key_namespace = Some("deploy-2".into());
    });
    let f = first.wrap_with(echo(&counter, Duration::ZERO), options.clone());
    let g = second.wrap_with(echo(&counter, Duration::ZERO), options.clone());

    f.call(vec![Value::from(1)]).await.unwrap();
    settle().await;
    g.call(vec![Value::from(1)]).await.unwrap();
    settle().await;
    assert_eq!(counter.calls("echo"), 2);

    // a new handle in an existing namespace picks up its entries
    let h = first.wrap_with(echo(&counter, Duration::ZERO), options);
    h.call(vec![Value::from(1)]).await.unwrap();
    assert_eq!(counter.calls("echo"), 2);

    let keys = store.written_keys();
    assert!(keys[0].starts_with("memoize:deploy-1:"));
    assert!(keys[1].starts_with("memoize:deploy-2:"));
}

#[tokio::test]
async fn test_error_filter_freezes_accepted_error() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |_| ())
        .errors_when(|error| error.kind.as_deref() != Some("E1"));
    let counter = CallCounter::new();

    // the same arguments yield E1, then E2, then success
    let f = memoizer.wrap({
        let counter = counter.clone();
        move |_args: Vec<Value>| {
            counter.hit("attempt");
            let attempt = counter.calls("attempt");
            async move {
                match attempt {
                    1 => ResultTuple::err(ErrorValue::new("first").with_kind("E1")),
                    2 => ResultTuple::err(ErrorValue::new("second").with_kind("E2")),
                    _ => ResultTuple::ok([Value::from("success")]),
                }
            }
        }
    });

    let mut kinds = Vec::new();
    for _ in 0..4 {
        let result = f.call(vec![Value::from(1)]).await.unwrap();
        kinds.push(result.error().and_then(|error| error.kind.clone()));
        settle().await;
    }

    assert_eq!(counter.calls("attempt"), 2);
    assert_eq!(
        kinds,
        [
            Some("E1".to_owned()),
            Some("E2".to_owned()),
            Some("E2".to_owned()),
            Some("E2".to_owned()),
        ]
    );
}

#[tokio::test]
async fn test_unbounded_ttl_is_stored() {
    let store = TestStore::new();
    let memoizer = setup_memoizer(&store, |config| config.writes.max_concurrent_writes = 1);
    let counter = CallCounter::new();
    let forever = memoizer.wrap_with(
        echo(&counter, Duration::ZERO),
        WrapOptions::default().ttl(Ttl::computed(|_: &ResultTuple| Duration::MAX)),
    );
    let f = memoizer.wrap(echo(&counter, Duration::ZERO));

    for _ in 0..3 {
        forever.call(vec![Value::from(1)]).await.unwrap();
        settle().await;
    }
    for _ in 0..3 {
        f.call(vec![Value::from(2)]).await.unwrap();
        settle().await;
    }

    assert_eq!(counter.calls("echo"), 2);
    assert_eq!(store.writes(), 2);
}
