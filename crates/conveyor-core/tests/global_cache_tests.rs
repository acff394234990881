//! Concurrency properties of the global cache

use std::sync::Arc;
use std::time::Duration;

use conveyor_core::{CacheValue, GlobalCache};
use proptest::prelude::*;

fn cache(initial: i64) -> GlobalCache {
    GlobalCache::new([("COUNT".to_string(), CacheValue::Int(initial))], Duration::from_millis(1))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_concurrent_increments_lose_nothing(
        initial in -1_000i64..1_000,
        deltas in prop::collection::vec(prop::collection::vec(-50i64..50, 1..40), 1..8),
    ) {
        let cache = cache(initial);
        std::thread::scope(|scope| {
            for batch in &deltas {
                let cache = &cache;
                scope.spawn(move || {
                    for delta in batch {
                        cache.increment("COUNT", *delta).unwrap();
                    }
                });
            }
        });

        let expected = initial + deltas.iter().flatten().sum::<i64>();
        prop_assert_eq!(cache.get("COUNT"), Some(CacheValue::Int(expected)));
    }

    #[test]
    fn prop_formula_updates_are_serialized(
        workers in 1usize..6,
        rounds in 1usize..30,
    ) {
        let cache = cache(0);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    for _ in 0..rounds {
                        cache
                            .replace_via_formula("COUNT", |v| CacheValue::Int(v.as_int().unwrap_or_default() + 2))
                            .unwrap();
                    }
                });
            }
        });

        prop_assert_eq!(cache.get("COUNT"), Some(CacheValue::Int((workers * rounds * 2) as i64)));
    }
}

#[test]
fn test_signal_releases_waiter() {
    let cache = cache(0);
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            cache.await_signal("READY");
            cache.get("COUNT")
        });
        cache.increment("COUNT", 5).unwrap();
        cache.raise_signal("READY");
        assert_eq!(waiter.join().unwrap(), Some(CacheValue::Int(5)));
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_blocking_wait_on_worker_lets_other_tasks_run() {
    let cache = Arc::new(cache(0));

    // The waiter occupies the only worker; the raiser needs it too.
    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move {
            cache.await_signal("READY");
            cache.get("COUNT")
        }
    });
    tokio::task::yield_now().await;
    let raiser = tokio::spawn({
        let cache = cache.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cache.increment("COUNT", 3).unwrap();
            cache.raise_signal("READY");
        }
    });

    let seen = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("blocking wait starved the runtime")
        .unwrap();
    raiser.await.unwrap();
    assert_eq!(seen, Some(CacheValue::Int(3)));
}

#[tokio::test(flavor = "current_thread")]
async fn test_async_wait_shares_a_single_thread() {
    let cache = Arc::new(cache(0));
    let raiser = tokio::spawn({
        let cache = cache.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            cache.raise_signal("READY");
        }
    });
    cache.await_signal_async("READY").await;
    cache.await_condition_async(|c| c.is_signal_raised("READY")).await;
    raiser.await.unwrap();
}

#[test]
fn test_unknown_key_is_reported() {
    let cache = cache(0);
    assert!(cache.increment("MISSING", 1).is_err());
    assert!(cache.get("MISSING").is_none());
}
