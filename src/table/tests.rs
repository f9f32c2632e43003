/*
 * Created on Tue Jul 28 2026
 *
 * This file is part of shardmap, a concurrent sharded hash table library.
 *
 * shardmap is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * shardmap is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with shardmap. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {super::*, crate::hash};

fn slot_of(table: &Table<u64, u64>, key: u64) -> FindSlotResult {
    let h = hash::hash_key(&key);
    let h2 = hash::h2(h);
    let group = hash::initial_group(h, table.group_width(), table.capacity());
    table.find_slot(&key, h2, group)
}

fn put(table: &Table<u64, u64>, key: u64, value: u64) {
    match slot_of(table, key) {
        FindSlotResult::Empty { index, .. } => unsafe {
            let h2 = hash::h2(hash::hash_key(&key));
            table.insert_at(index, key, value, h2);
        },
        FindSlotResult::Found(index) => unsafe {
            table.overwrite_value_at(index, value);
        },
        FindSlotResult::NoFreeSlot => panic!("table full in test"),
    }
}

fn get(table: &Table<u64, u64>, key: u64) -> Option<u64> {
    let h = hash::hash_key(&key);
    let h2 = hash::h2(h);
    let group = hash::initial_group(h, table.group_width(), table.capacity());
    table.lookup(&key, h2, group)
}

#[test]
fn insert_then_lookup_roundtrips() {
    let t: Table<u64, u64> = Table::new(64, 16, 4);
    put(&t, 42, 100);
    assert_eq!(get(&t, 42), Some(100));
    assert_eq!(get(&t, 43), None);
}

#[test]
fn overwrite_existing_key_updates_value_not_slot() {
    let t: Table<u64, u64> = Table::new(64, 16, 4);
    put(&t, 7, 1);
    put(&t, 7, 2);
    assert_eq!(get(&t, 7), Some(2));
}

#[test]
fn remove_then_lookup_misses() {
    let t: Table<u64, u64> = Table::new(64, 16, 4);
    put(&t, 7, 1);
    if let FindSlotResult::Found(idx) = slot_of(&t, 7) {
        unsafe { t.remove_at(idx) };
    } else {
        panic!("expected to find just-inserted key");
    }
    assert_eq!(get(&t, 7), None);
}

#[test]
fn remove_at_tail_of_chain_becomes_empty_not_tombstone() {
    let t: Table<u64, u64> = Table::new(16, 16, 1);
    put(&t, 1, 1);
    let (val, effect) = match slot_of(&t, 1) {
        FindSlotResult::Found(idx) => unsafe { t.remove_at(idx) },
        _ => panic!(),
    };
    assert_eq!(val, 1);
    assert!(matches!(effect, RemoveEffect::BecameEmpty { .. }));
}

#[test]
fn rebuild_into_preserves_all_live_entries() {
    let small: Table<u64, u64> = Table::new(16, 16, 1);
    for k in 0..10u64 {
        put(&small, k, k * 10);
    }
    let big: Table<u64, u64> = Table::new(32, 16, 2);
    small.rebuild_into(&big);
    for k in 0..10u64 {
        assert_eq!(get(&big, k), Some(k * 10));
    }
}

#[test]
fn many_insertions_within_one_group_probe_next_group() {
    // group_width 8 on a 16-slot table forces the second probe group to be
    // used once the first fills up past its load.
    let t: Table<u64, u64> = Table::new(16, 8, 2);
    for k in 0..12u64 {
        put(&t, k, k);
    }
    for k in 0..12u64 {
        assert_eq!(get(&t, k), Some(k));
    }
}
