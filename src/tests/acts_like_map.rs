//! In these tests, we make sure the SnapMap behaves exactly like a plain HashMap as long as the
//! operations are applied sequentially ‒ same results out of every operation, same final
//! content.
//!
//! To do that we generate series of random operations (the full menu: loads, stores, swaps,
//! deletes, the compare-and family and clears) and run them against both maps side by side.
//!
//! Each test runs in several instances with differently sized key universes. The small ones
//! hit the same key over and over ‒ which is what drags the internals through the
//! delete/expunge/resurrect and promotion cycles ‒ while the large ones exercise fresh-key
//! inserts.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use proptest::collection::vec;
use proptest::prelude::*;
use rayon::prelude::*;

use crate::SnapMap;

#[derive(Debug, Clone)]
enum Instruction<K, V> {
    Load(K),
    Store(K, V),
    LoadOrStore(K, V),
    LoadAndDelete(K),
    Delete(K),
    Swap(K, V),
    CompareAndSwap(K, V, V),
    CompareAndDelete(K, V),
    Clear,
}

impl<K, V> Instruction<K, V>
where
    K: Arbitrary + Clone + Debug + Eq + Hash + 'static,
    V: Arbitrary + Clone + Debug + PartialEq + 'static,
{
    fn strategy() -> impl Strategy<Value = Self> {
        use Instruction::*;

        prop_oneof![
            any::<K>().prop_map(Load),
            any::<(K, V)>().prop_map(|(k, v)| Store(k, v)),
            any::<(K, V)>().prop_map(|(k, v)| LoadOrStore(k, v)),
            any::<K>().prop_map(LoadAndDelete),
            any::<K>().prop_map(Delete),
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
                    let expected = oracle.get(&key).cloned();
                    prop_assert_eq!(expected, map.load(&key));
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
                    let expected = oracle.remove(&key);
                    prop_assert_eq!(expected, map.load_and_delete(&key));
                }
                Delete(key) => {
                    oracle.remove(&key);
                    map.delete(&key);
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

        // And after the dust settles, both maps hold the same things.
        let mut content = HashMap::new();
        map.range(|key, value| {
            assert!(
                content.insert(key.clone(), value.clone()).is_none(),
                "Range visited a key twice",
            );
            true
        });
        prop_assert_eq!(oracle, content);

        Ok(())
    }
}

fn store_parallel_test<T>(values: Vec<T>) -> Result<(), TestCaseError>
where
    T: Clone + Hash + Eq + Send + Sync + Debug,
{
    let set: HashSet<_> = values.iter().cloned().collect();
    let map = SnapMap::new();
    values.into_par_iter().for_each(|v| {
        map.store(v, ());
    });
    for v in set {
        prop_assert_eq!(Some(()), map.load(&v));
    }

    Ok(())
}

proptest! {

    #[test]
    fn small_keys(instructions in vec(Instruction::<u8, u8>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn mid_keys(instructions in vec(Instruction::<u16, u8>::strategy(), 1..10_000)) {
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

    #[test]
    fn store_all_small_parallel(values in vec(any::<u8>(), 1..10_000)) {
        store_parallel_test(values)?;
    }

    #[test]
    fn store_all_mid_parallel(values in vec(any::<u16>(), 1..10_000)) {
        store_parallel_test(values)?;
    }

    #[test]
    fn store_all_large_parallel(values in vec(any::<usize>(), 1..10_000)) {
        store_parallel_test(values)?;
    }
}
