use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread;

use concur_map::{Lfht, Map};
use rand::seq::SliceRandom;
use rand::thread_rng;

/// S5: 4 threads each insert a disjoint range of 10 000 keys, then 4
/// threads remove half of those keys chosen at random; the final size
/// must equal exactly the number of keys left un-removed.
#[test]
fn s5_concurrent_insert_then_random_partial_remove() {
    let _ = env_logger::try_init();

    const PER_THREAD: i64 = 10_000;
    const THREADS: i64 = 4;

    let table = Arc::new(Lfht::<i64, i64>::new());

    let mut inserters = Vec::new();
    for t in 0..THREADS {
        let table = Arc::clone(&table);
        inserters.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let key = t * PER_THREAD + i;
                assert!(table.insert(key, key * 2));
            }
        }));
    }
    for h in inserters {
        h.join().unwrap();
    }
    assert_eq!(table.len() as i64, THREADS * PER_THREAD);

    let all_keys: Vec<i64> = (0..THREADS * PER_THREAD).collect();
    let to_remove: Arc<Vec<i64>> = {
        let mut keys = all_keys.clone();
        keys.shuffle(&mut thread_rng());
        Arc::new(keys.into_iter().take((THREADS * PER_THREAD / 2) as usize).collect())
    };
    let removed = Arc::new(Mutex::new(HashSet::new()));

    let mut removers = Vec::new();
    for chunk in to_remove.chunks((to_remove.len() / THREADS as usize).max(1)) {
        let table = Arc::clone(&table);
        let chunk = chunk.to_vec();
        let removed = Arc::clone(&removed);
        removers.push(thread::spawn(move || {
            for key in chunk {
                if table.remove(&key) {
                    removed.lock().unwrap().insert(key);
                }
            }
        }));
    }
    for h in removers {
        h.join().unwrap();
    }

    let removed = removed.lock().unwrap();
    assert_eq!(removed.len(), to_remove.len());
    assert_eq!(table.len(), all_keys.len() - removed.len());

    for key in &all_keys {
        let expected = if removed.contains(key) {
            None
        } else {
            Some(key * 2)
        };
        assert_eq!(table.get(key), expected);
    }
}
