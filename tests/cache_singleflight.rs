//! Cache single-flight and concurrency tests
//!
//! The core property: two jobs submitted concurrently with an identical
//! key trigger the underlying computation exactly once.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use varship::cache::{CacheError, CacheStore};

fn payload_dir(temp: &TempDir, name: &str, content: &str) -> PathBuf {
    let dir = temp.path().join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("app.apk"), content).unwrap();
    dir
}

#[test]
fn test_concurrent_identical_key_computes_once() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(&temp.path().join("cache")).unwrap());
    let computations = Arc::new(AtomicUsize::new(0));
    let key = "aa".repeat(32);

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            let computations = Arc::clone(&computations);
            let key = key.clone();
            let src = payload_dir(&temp, &format!("src-{worker}"), "shared-layer");
            thread::spawn(move || {
                store
                    .get_or_compute::<CacheError, _>(&key, || {
                        computations.fetch_add(1, Ordering::SeqCst);
                        // Deliberately slow so siblings arrive mid-flight
                        thread::sleep(Duration::from_millis(100));
                        Ok(src)
                    })
                    .unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect();

    assert_eq!(
        computations.load(Ordering::SeqCst),
        1,
        "identical key must collapse to a single computation"
    );
    assert_eq!(results.iter().filter(|(_, hit)| !hit).count(), 1);
    for (entry, _) in results {
        assert_eq!(
            fs::read_to_string(entry.path.join("app.apk")).unwrap(),
            "shared-layer"
        );
    }
}

#[test]
fn test_distinct_keys_compute_independently() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(&temp.path().join("cache")).unwrap());
    let computations = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            let computations = Arc::clone(&computations);
            let key = format!("{worker:02}").repeat(32);
            let src = payload_dir(&temp, &format!("src-{worker}"), &format!("layer-{worker}"));
            thread::spawn(move || {
                store
                    .get_or_compute::<CacheError, _>(&key, || {
                        computations.fetch_add(1, Ordering::SeqCst);
                        Ok(src)
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(computations.load(Ordering::SeqCst), 4);
}

#[test]
fn test_failed_producer_does_not_poison_key() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(&temp.path().join("cache")).unwrap();
    let key = "bb".repeat(32);

    let failed = store.get_or_compute::<CacheError, _>(&key, || {
        Err(CacheError::NotADirectory(PathBuf::from("/nope")))
    });
    assert!(failed.is_err());

    // The key is free again: a later caller computes successfully
    let src = payload_dir(&temp, "retry", "second-attempt");
    let (entry, hit) = store
        .get_or_compute::<CacheError, _>(&key, || Ok(src))
        .unwrap();
    assert!(!hit);
    assert_eq!(
        fs::read_to_string(entry.path.join("app.apk")).unwrap(),
        "second-attempt"
    );
}

#[test]
fn test_waiters_recover_when_producer_fails() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(CacheStore::open(&temp.path().join("cache")).unwrap());
    let attempts = Arc::new(AtomicUsize::new(0));
    let key = "cc".repeat(32);

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = Arc::clone(&store);
            let attempts = Arc::clone(&attempts);
            let key = key.clone();
            let src = payload_dir(&temp, &format!("recover-{worker}"), "recovered");
            thread::spawn(move || {
                store.get_or_compute::<CacheError, _>(&key, || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    if attempt == 0 {
                        // First producer fails; a waiter must take over
                        Err(CacheError::NotADirectory(PathBuf::from("/nope")))
                    } else {
                        Ok(src)
                    }
                })
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("worker panicked"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
    assert!(results.iter().filter(|r| r.is_ok()).count() >= 1);

    // And the key now serves hits
    let (entry, hit) = store
        .get_or_compute::<CacheError, _>(&key, || panic!("must not recompute"))
        .unwrap();
    assert!(hit);
    assert_eq!(
        fs::read_to_string(entry.path.join("app.apk")).unwrap(),
        "recovered"
    );
}
