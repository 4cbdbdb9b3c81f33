//! Model tests through the public API only: random operation sequences against a HashMap
//! oracle, plus a few cross-thread smoke tests that the per-key results stay sane under
//! concurrency.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crossbeam_utils::thread;
use proptest::collection::vec;
use proptest::prelude::*;
use synckit::SnapMap;

#[derive(Debug, Clone)]
enum Instruction<K, V> {
    Load(K),
    Store(K, V),
    LoadOrStore(K, V),
    LoadAndDelete(K),
    Swap(K, V),
    CompareAndSwap(K, V, V),
    CompareAndDelete(K, V),
    Clear,
}

impl<K, V> Instruction<K, V>
where
    K: Arbitrary + Clone + Debug + Eq + Hash,
    V: Arbitrary + Clone + Debug + PartialEq,
{
    fn strategy() -> impl Strategy<Value = Self> {
        use Instruction::*;

        prop_oneof![
            any::<K>().prop_map(Load),
            any::<(K, V)>().prop_map(|(k, v)| Store(k, v)),
            any::<(K, V)>().prop_map(|(k, v)| LoadOrStore(k, v)),
            any::<K>().prop_map(LoadAndDelete),
            any::<(K, V)>().prop_map(|(k, v)| Swap(k, v)),
            any::<(K, V, V)>().prop_map(|(k, old, new)| CompareAndSwap(k, old, new)),
            any::<(K, V)>().prop_map(|(k, old)| CompareAndDelete(k, old)),
            Just(Clear),
        ]
    }

    fn run(instructions: Vec<Self>) -> Result<(), TestCaseError> {
        use Instruction::*;

        let map = SnapMap::new();
        let mut oracle = HashMap::new();
        for ins in instructions {
            match ins {
                Load(key) => {
                    prop_assert_eq!(oracle.get(&key).cloned(), map.load(&key));
                }
                Store(key, value) => {
                    map.store(key.clone(), value.clone());
                    oracle.insert(key, value);
                }
                LoadOrStore(key, value) => {
                    let expected_loaded = oracle.contains_key(&key);
                    let expected = oracle.entry(key.clone()).or_insert(value.clone()).clone();
                    let found = map.load_or_store(key, value);
                    prop_assert_eq!(expected_loaded, !found.is_new());
                    prop_assert_eq!(expected, found.into_inner());
                }
                LoadAndDelete(key) => {
                    prop_assert_eq!(oracle.remove(&key), map.load_and_delete(&key));
                }
                Swap(key, value) => {
                    let expected = oracle.insert(key.clone(), value.clone());
                    prop_assert_eq!(expected, map.swap(key, value));
                }
                CompareAndSwap(key, old, new) => {
                    let expected = if oracle.get(&key) == Some(&old) {
                        oracle.insert(key.clone(), new.clone());
                        true
                    } else {
                        false
                    };
                    prop_assert_eq!(expected, map.compare_and_swap(&key, &old, new));
                }
                CompareAndDelete(key, old) => {
                    let expected = if oracle.get(&key) == Some(&old) {
                        oracle.remove(&key);
                        true
                    } else {
                        false
                    };
                    prop_assert_eq!(expected, map.compare_and_delete(&key, &old));
                }
                Clear => {
                    map.clear();
                    oracle.clear();
                }
            }
        }

        let mut content = HashMap::new();
        map.range(|key, value| {
            assert!(content.insert(key.clone(), value.clone()).is_none());
            true
        });
        prop_assert_eq!(oracle, content);

        Ok(())
    }
}

proptest! {
    #[test]
    fn small_keys(instructions in vec(Instruction::<u8, u8>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn large_keys(instructions in vec(Instruction::<usize, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn string_keys(instructions in vec(Instruction::<String, u8>::strategy(), 1..100)) {
        Instruction::run(instructions)?;
    }
}

/// Every thread load-or-stores the same key; exactly one of them gets to insert, everyone reads
/// the winner's value.
#[test]
fn load_or_store_one_winner() {
    const THREADS: usize = 8;

    for _ in 0..100 {
        let map = SnapMap::new();
        let winners = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|t| {
                    let map = &map;
                    s.spawn(move |_| map.load_or_store("key", t).is_new())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|&won| won)
                .count()
        })
        .unwrap();
        assert_eq!(1, winners);
    }
}

/// Concurrent compare-and-swap chains: only a thread that saw the current value advances it, so
/// the final value is the sum of the successful increments.
#[test]
fn compare_and_swap_is_atomic() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1000;

    let map = SnapMap::new();
    map.store((), 0usize);
    thread::scope(|s| {
        for _ in 0..THREADS {
            let map = &map;
            s.spawn(move |_| {
                for _ in 0..PER_THREAD {
                    loop {
                        let current = map.load(&()).expect("Key never deleted");
                        if map.compare_and_swap(&(), &current, current + 1) {
                            break;
                        }
                    }
                }
            });
        }
    })
    .unwrap();
    assert_eq!(Some(THREADS * PER_THREAD), map.load(&()));
}

/// A value observed under a key is always one that was actually stored under that key.
#[test]
fn no_value_from_thin_air() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 2000;

    let map = SnapMap::new();
    thread::scope(|s| {
        for t in 0..THREADS {
            let map = &map;
            s.spawn(move |_| {
                for i in 0..ROUNDS {
                    map.store("slot", (t, i));
                    if let Some((seen_t, seen_i)) = map.load(&"slot") {
                        assert!(seen_t < THREADS && seen_i < ROUNDS);
                    }
                    if t % 2 == 0 {
                        map.delete(&"slot");
                    }
                }
            });
        }
    })
    .unwrap();
}
