/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::init_logger;
use crate::{
    registry::{Database, HandleMap},
    VmmError,
};

/// Slot as the test expects it to be
#[derive(Debug)]
struct Expected {
    value: u64,
    refs: u16,
    pending: bool,
}

type Recycled = Arc<Mutex<Vec<(u32, u64)>>>;

fn recorder() -> (Recycled, impl Fn(u32, Arc<u64>) + Send + Sync + 'static) {
    let recycled: Recycled = Arc::new(Mutex::new(Vec::new()));
    let sink = recycled.clone();
    (recycled, move |index: u32, value: Arc<u64>| {
        sink.lock().unwrap().push((index, *value));
    })
}

fn take_recycled(recycled: &Recycled) -> Vec<(u32, u64)> {
    std::mem::take(&mut *recycled.lock().unwrap())
}

#[test]
fn test_database_random_workload() {
    init_logger();
    const SEED: u64 = 7_296_341_115_223_000_481;
    let mut rand = SmallRng::seed_from_u64(SEED);

    let (recycled, callback) = recorder();
    let database = Database::with_callback(4, 3, callback).unwrap();
    let mut expected: HashMap<u32, Expected> = HashMap::new();
    let mut next_value = 0u64;

    for _ in 0..3000 {
        let indices: Vec<u32> = expected.keys().copied().collect();
        let free_pos_before = database.free_pos().unwrap();

        match rand.gen_range(0..10) {
            0..=3 => {
                let value = next_value;
                next_value += 1;
                let index = database.insert_or_expand(value).unwrap();
                assert!(!expected.contains_key(&index));
                expected.insert(
                    index,
                    Expected {
                        value,
                        refs: 0,
                        pending: false,
                    },
                );
                assert!(database.free_pos().unwrap() >= free_pos_before);
            }
            4..=5 if !indices.is_empty() => {
                let index = indices[rand.gen_range(0..indices.len())];
                let slot = expected.get_mut(&index).unwrap();
                match database.get(index) {
                    Ok(value) => {
                        assert!(!slot.pending);
                        assert_eq!(*value, slot.value);
                        slot.refs += 1;
                    }
                    Err(err) => {
                        assert!(slot.pending);
                        assert_eq!(err, VmmError::InvalidArgument);
                    }
                }
            }
            6..=7 if !indices.is_empty() => {
                let index = indices[rand.gen_range(0..indices.len())];
                let slot = expected.get_mut(&index).unwrap();
                if slot.refs == 0 {
                    assert_eq!(database.unuse(index), Err(VmmError::InvalidArgument));
                    continue;
                }

                database.unuse(index).unwrap();
                slot.refs -= 1;
                if slot.refs == 0 && slot.pending {
                    let slot = expected.remove(&index).unwrap();
                    assert_eq!(take_recycled(&recycled), vec![(index, slot.value)]);
                }
            }
            8..=9 if !indices.is_empty() => {
                let index = indices[rand.gen_range(0..indices.len())];
                database.remove(index, false).unwrap();

                let slot = expected.get_mut(&index).unwrap();
                slot.pending = true;
                if slot.refs == 0 {
                    let slot = expected.remove(&index).unwrap();
                    assert_eq!(take_recycled(&recycled), vec![(index, slot.value)]);
                }
            }
            _ => {}
        }

        // nothing is recycled behind our back
        assert!(take_recycled(&recycled).is_empty());

        assert_eq!(database.len().unwrap(), expected.len());
        let highest = expected.keys().map(|index| *index as usize + 1).max();
        assert_eq!(database.free_pos().unwrap(), highest.unwrap_or(0));
    }

    // stored values survived every expansion
    assert!(database.expansion_count() > 0);
    for (index, slot) in expected.iter() {
        if !slot.pending {
            assert_eq!(*database.pin(*index).unwrap(), slot.value);
        }
    }
}

#[test]
fn test_handle_map_random_workload() {
    init_logger();
    const SEED: u64 = 1_845_004_776_512_330_919;
    let mut rand = SmallRng::seed_from_u64(SEED);

    let (recycled, callback) = recorder();
    let map = HandleMap::with_callback(2, 5, 3, callback).unwrap();

    // keys drawn from a small pool, so duplicates and revivals happen
    let keys: Vec<u64> = (0..40).map(|_| rand.gen::<u64>()).collect();
    let mut expected: HashMap<u64, (u32, Expected)> = HashMap::new();
    let mut next_value = 0u64;

    for _ in 0..3000 {
        let key = keys[rand.gen_range(0..keys.len())];

        match rand.gen_range(0..4) {
            0 => {
                let value = next_value;
                next_value += 1;
                let res = map.insert_or_expand_with(key, || Ok(value));
                match expected.get_mut(&key) {
                    None => {
                        let inserted = res.unwrap();
                        assert!(!inserted.resurrected);
                        expected.insert(
                            key,
                            (
                                inserted.index,
                                Expected {
                                    value,
                                    refs: 0,
                                    pending: false,
                                },
                            ),
                        );
                    }
                    Some((index, slot)) if slot.pending => {
                        let inserted = res.unwrap();
                        assert!(inserted.resurrected);
                        assert_eq!(inserted.index, *index);
                        slot.pending = false;
                    }
                    Some(_) => assert_eq!(res, Err(VmmError::InvalidArgument)),
                }
            }
            1 => match (map.get(key), expected.get_mut(&key)) {
                (Ok((index, value)), Some((expected_index, slot))) => {
                    assert!(!slot.pending);
                    assert_eq!(index, *expected_index);
                    assert_eq!(*value, slot.value);
                    slot.refs += 1;
                }
                (Err(VmmError::InvalidArgument), None) => {}
                (Err(VmmError::InvalidArgument), Some((_, slot))) => assert!(slot.pending),
                (res, slot) => panic!("get({:#x}) = {:?}, expected {:?}", key, res.map(|(i, _)| i), slot),
            },
            2 => {
                let Some((index, slot)) = expected.get_mut(&key) else {
                    continue;
                };
                if slot.refs == 0 {
                    continue;
                }

                let index = *index;
                map.unuse(index).unwrap();
                slot.refs -= 1;
                if slot.refs == 0 && slot.pending {
                    let (_, slot) = expected.remove(&key).unwrap();
                    assert_eq!(take_recycled(&recycled), vec![(index, slot.value)]);
                }
            }
            _ => match expected.get_mut(&key) {
                None => assert_eq!(map.remove(key, false), Err(VmmError::InvalidArgument)),
                Some((index, slot)) => {
                    let index = *index;
                    map.remove(key, false).unwrap();
                    slot.pending = true;
                    if slot.refs == 0 {
                        let (_, slot) = expected.remove(&key).unwrap();
                        assert_eq!(take_recycled(&recycled), vec![(index, slot.value)]);
                    }
                }
            },
        }

        assert!(take_recycled(&recycled).is_empty());
        assert_eq!(map.len().unwrap(), expected.len());
    }

    assert!(map.expansion_count() > 0);
}

#[test]
fn test_17_inserts_expand_once() {
    init_logger();
    let map = HandleMap::new(16, 16, 4).unwrap();

    let keys: Vec<u64> = (0..17u64).map(|i| i * 0x1_0000_0001).collect();
    for (i, key) in keys.iter().enumerate() {
        map.insert_or_expand_with(*key, || Ok(i)).unwrap();
    }

    assert_eq!(map.expansion_count(), 1);
    assert_eq!(map.capacity().unwrap(), 32);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(*map.pin(*key).unwrap(), i);
    }
}
