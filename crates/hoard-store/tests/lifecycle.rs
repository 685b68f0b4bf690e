//! End-to-end lifecycle scenarios against the public API.

use std::{
    fs,
    path::PathBuf,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use hoard_domain::ContentHash;
use hoard_store::{
    BuildOutcome, Construct, ConstructOrWait, ContentStore, KeyStatus, Lookup, StoreError,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

fn new_store() -> (tempfile::TempDir, ContentStore) {
    let temp = tempfile::tempdir().unwrap();
    let store = ContentStore::open(Some(temp.path().join("store"))).unwrap();
    (temp, store)
}

fn key(n: u8) -> ContentHash {
    ContentHash::new([n; 32])
}

#[test]
fn a_fresh_store_knows_nothing() {
    let (_temp, store) = new_store();
    assert_eq!(store.query(&key(1)).unwrap(), KeyStatus::Missing);
}

#[test]
fn produce_and_consume_one_result() {
    let (_temp, store) = new_store();
    let hash = key(1);

    let build = store.mark_pending(&hash).unwrap();
    fs::create_dir(build.join("out")).unwrap();
    fs::write(build.join("out/x"), b"a").unwrap();
    let item = store.mark_complete(&hash).unwrap();

    match store.lookup(&hash).unwrap() {
        Lookup::Complete(found) => {
            assert_eq!(found, item);
            assert_eq!(fs::read(found.path.join("out/x")).unwrap(), b"a");
            assert!(fs::metadata(found.path.join("out/x"))
                .unwrap()
                .permissions()
                .readonly());
        }
        other => panic!("expected a completed item, got {other:?}"),
    }
}

#[test]
fn concurrent_producers_elect_one_builder() {
    let (_temp, store) = new_store();
    let store = Arc::new(store);
    let hash = key(1);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            store.construct_if_missing(&hash).unwrap()
        }));
    }
    let results: Vec<Construct> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    let build_dirs: Vec<&PathBuf> = results
        .iter()
        .filter_map(|result| match result {
            Construct::Missing(build) => Some(build),
            _ => None,
        })
        .collect();
    assert_eq!(build_dirs.len(), 1, "exactly one caller may build");
    assert!(results
        .iter()
        .all(|result| !matches!(result, Construct::Complete(_))));
}

#[test]
fn byte_identical_outputs_collapse_to_one_item() {
    let (_temp, store) = new_store();
    let (key_a, key_b) = (key(1), key(2));

    for hash in [&key_a, &key_b] {
        let build = store.mark_pending(hash).unwrap();
        fs::write(build.join("result"), b"identical output bytes").unwrap();
        store.mark_complete(hash).unwrap();
    }

    let (item_a, item_b) = match (
        store.lookup(&key_a).unwrap(),
        store.lookup(&key_b).unwrap(),
    ) {
        (Lookup::Complete(a), Lookup::Complete(b)) => (a, b),
        other => panic!("expected two completed items, got {other:?}"),
    };
    assert_eq!(item_a, item_b);

    let listing = store.list_all().unwrap();
    assert_eq!(listing.items.len(), 1);
    assert_eq!(listing.complete.len(), 2);
}

#[test]
fn abandoning_a_build_fails_its_waiters() {
    let (_temp, store) = new_store();
    let store = Arc::new(store);
    let hash = key(1);
    store.mark_pending(&hash).unwrap();

    let sub = match store.construct_or_wait(&hash).unwrap() {
        ConstructOrWait::Pending(sub) => sub,
        other => panic!("expected a pending subscription, got {other:?}"),
    };
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(sub.wait());
    });

    let remover = Arc::clone(&store);
    thread::spawn(move || remover.remove_failed(&hash).unwrap())
        .join()
        .unwrap();

    assert_eq!(
        rx.recv_timeout(WAIT_TIMEOUT).unwrap().unwrap(),
        BuildOutcome::Failed
    );
}

#[test]
fn removing_an_item_leaves_a_detectable_corruption() {
    let (_temp, store) = new_store();
    let hash = key(1);
    let build = store.mark_pending(&hash).unwrap();
    fs::write(build.join("x"), b"a").unwrap();
    let item = store.mark_complete(&hash).unwrap();

    store.remove_item_forcibly(&item).unwrap();

    let err = store.query(&hash).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::CorruptedLink { .. })
    ));
}

/// Transitions and queries interleaved from many threads never observe a
/// torn state, and a builder that won `construct_if_missing` keeps its build
/// directory until it completes or abandons it itself.
#[test]
fn interleaved_operations_stay_consistent() {
    let (_temp, store) = new_store();
    let store = Arc::new(store);
    let hash = key(1);

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            for round in 0..16 {
                match store.construct_if_missing(&hash).unwrap() {
                    Construct::Missing(build) => {
                        fs::write(build.join("out"), format!("{worker}-{round}")).unwrap();
                        if round % 2 == 0 {
                            store.mark_complete(&hash).unwrap();
                        } else {
                            store.remove_failed(&hash).unwrap();
                        }
                    }
                    Construct::Pending => {
                        // Whatever the key settled to by now, the tag query
                        // must answer cleanly.
                        store.query(&hash).unwrap();
                    }
                    Construct::Complete(item) => {
                        assert!(item.path.is_dir());
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // The storm over, the key is in exactly one well-formed state.
    let status = store.query(&hash).unwrap();
    assert!(matches!(
        status,
        KeyStatus::Missing | KeyStatus::Pending | KeyStatus::Complete
    ));
}
