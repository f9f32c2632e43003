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

//! One independent hash partition: its own table pointer (swapped on
//! resize), live/tombstone counters, and (if enabled) a combining queue.
//! Every mutating method here assumes the caller already holds this
//! shard's lock — `Dictionary` is responsible for acquiring it, either
//! directly or by draining the combining queue while holding it.

use {
    crate::{
        combine::{CombineQueue, Op, OpResult, UpdateExisting, ValueSource},
        config::DictConfig,
        hash::{self, Pod},
        qsbr::Qsbr,
        table::{FindSlotResult, RemoveEffect, Table},
    },
    std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

pub(crate) struct Shard<K, V> {
    table: AtomicPtr<Table<K, V>>,
    count: AtomicUsize,
    tombstones: AtomicUsize,
    pub(crate) combine: Option<CombineQueue<K, V>>,
}

impl<K: Pod, V: Pod> Shard<K, V> {
    pub(crate) fn new(cfg: &DictConfig) -> Self {
        let capacity = cfg.initial_capacity_per_shard;
        let table = Table::new(capacity, cfg.group_width, cfg.effective_max_probe_groups(capacity));
        Self {
            table: AtomicPtr::new(Box::into_raw(Box::new(table))),
            count: AtomicUsize::new(0),
            tombstones: AtomicUsize::new(0),
            combine: cfg.enable_combining.then(|| CombineQueue::new(cfg.combining_slots)),
        }
    }

    #[inline]
    fn table_ptr(&self) -> *mut Table<K, V> {
        self.table.load(Ordering::Acquire)
    }

    /// Lock-free read path: the caller must already be inside a QSBR
    /// epoch-protected read (or hold the shard lock).
    pub(crate) fn lookup(&self, key: &K, key_hash: u64) -> Option<V> {
        let table = unsafe { &*self.table_ptr() };
        let h2 = hash::h2(key_hash);
        let group = hash::initial_group(key_hash, table.group_width(), table.capacity());
        table.lookup(key, h2, group)
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        unsafe { &*self.table_ptr() }.capacity()
    }

    /// Runs one mutating op under the shard lock, then checks whether the
    /// table needs to grow or be rehashed in place. This is the exact
    /// function both a direct caller and the combining drain loop invoke —
    /// the combining path never re-derives its own copy of this logic.
    pub(crate) fn apply_and_maybe_resize(&self, cfg: &DictConfig, qsbr: &Qsbr<K, V>, op: Op<K, V>) -> OpResult<V> {
        let result = self.run_locked(op);
        self.maybe_resize(cfg, qsbr);
        result
    }

    fn run_locked(&self, op: Op<K, V>) -> OpResult<V> {
        let table = unsafe { &*self.table_ptr() };
        let h2 = hash::h2(op.key_hash());
        let group = hash::initial_group(op.key_hash(), table.group_width(), table.capacity());
        match op {
            Op::TryAdd { key, source, .. } => self.locked_try_add(table, h2, group, key, source),
            Op::GetOrAdd { key, source, .. } => self.locked_get_or_add(table, h2, group, key, source),
            Op::AddOrUpdate { key, add, update, .. } => self.locked_add_or_update(table, h2, group, key, add, update),
            Op::TryUpdate { key, value, expected, .. } => self.locked_try_update(table, h2, group, key, value, expected),
            Op::TryRemove { key, .. } => self.locked_try_remove(table, h2, group, key),
        }
    }

    fn resolve_source(key: &K, source: ValueSource<K, V>) -> Result<V, OpResult<V>> {
        match source {
            ValueSource::Value(v) => Ok(v),
            ValueSource::Factory(mut f) => f.call(key).map_err(|e| OpResult { value: None, inserted: false, error: Some(e) }),
        }
    }

    fn locked_try_add(&self, table: &Table<K, V>, h2: u8, group: usize, key: K, source: ValueSource<K, V>) -> OpResult<V> {
        match table.find_slot(&key, h2, group) {
            FindSlotResult::Found(_) => OpResult { value: None, inserted: false, error: None },
            FindSlotResult::Empty { index, used_tombstone } => {
                let value = match Self::resolve_source(&key, source) {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                unsafe { table.insert_at(index, key, value, h2) };
                self.account_insert(used_tombstone);
                OpResult { value: None, inserted: true, error: None }
            }
            FindSlotResult::NoFreeSlot => invariant_violation(),
        }
    }

    fn locked_get_or_add(&self, table: &Table<K, V>, h2: u8, group: usize, key: K, source: ValueSource<K, V>) -> OpResult<V> {
        match table.find_slot(&key, h2, group) {
            FindSlotResult::Found(index) => {
                let existing = unsafe { table.value_at(index) };
                OpResult { value: Some(existing), inserted: false, error: None }
            }
            FindSlotResult::Empty { index, used_tombstone } => {
                let value = match Self::resolve_source(&key, source) {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                unsafe { table.insert_at(index, key, value, h2) };
                self.account_insert(used_tombstone);
                OpResult { value: Some(value), inserted: true, error: None }
            }
            FindSlotResult::NoFreeSlot => invariant_violation(),
        }
    }

    /// On `Found`, applies `update(existing)` under the lock; on `Empty`,
    /// resolves and inserts `add` instead. Exactly one of the two sources
    /// is ever consulted for a given call.
    fn locked_add_or_update(
        &self,
        table: &Table<K, V>,
        h2: u8,
        group: usize,
        key: K,
        add: ValueSource<K, V>,
        mut update: Box<dyn UpdateExisting<V>>,
    ) -> OpResult<V> {
        match table.find_slot(&key, h2, group) {
            FindSlotResult::Found(index) => {
                let existing = unsafe { table.value_at(index) };
                let value = match update.call(&existing) {
                    Ok(v) => v,
                    Err(e) => return OpResult { value: None, inserted: false, error: Some(e) },
                };
                unsafe { table.overwrite_value_at(index, value) };
                OpResult { value: Some(value), inserted: false, error: None }
            }
            FindSlotResult::Empty { index, used_tombstone } => {
                let value = match Self::resolve_source(&key, add) {
                    Ok(v) => v,
                    Err(failed) => return failed,
                };
                unsafe { table.insert_at(index, key, value, h2) };
                self.account_insert(used_tombstone);
                OpResult { value: Some(value), inserted: true, error: None }
            }
            FindSlotResult::NoFreeSlot => invariant_violation(),
        }
    }

    fn locked_try_update(&self, table: &Table<K, V>, h2: u8, group: usize, key: K, value: V, expected: Option<V>) -> OpResult<V> {
        match table.find_slot(&key, h2, group) {
            FindSlotResult::Found(index) => {
                let current = unsafe { table.value_at(index) };
                if let Some(expected) = expected {
                    if !hash::bytes_eq(&current, &expected) {
                        return OpResult { value: Some(current), inserted: false, error: None };
                    }
                }
                unsafe { table.overwrite_value_at(index, value) };
                OpResult { value: Some(current), inserted: true, error: None }
            }
            FindSlotResult::Empty { .. } => OpResult { value: None, inserted: false, error: None },
            FindSlotResult::NoFreeSlot => invariant_violation(),
        }
    }

    fn locked_try_remove(&self, table: &Table<K, V>, h2: u8, group: usize, key: K) -> OpResult<V> {
        match table.find_slot(&key, h2, group) {
            FindSlotResult::Found(index) => {
                let (value, effect) = unsafe { table.remove_at(index) };
                self.count.fetch_sub(1, Ordering::Relaxed);
                match effect {
                    RemoveEffect::BecameEmpty { reclaimed } => {
                        if reclaimed > 0 {
                            self.tombstones.fetch_sub(reclaimed, Ordering::Relaxed);
                        }
                    }
                    RemoveEffect::MarkedTombstone => {
                        self.tombstones.fetch_add(1, Ordering::Relaxed);
                    }
                }
                OpResult { value: Some(value), inserted: false, error: None }
            }
            FindSlotResult::Empty { .. } => OpResult { value: None, inserted: false, error: None },
            FindSlotResult::NoFreeSlot => invariant_violation(),
        }
    }

    fn account_insert(&self, used_tombstone: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if used_tombstone {
            self.tombstones.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Grows the table if the combined live+tombstone load exceeds the
    /// configured factor, or rehashes in place (same capacity) if
    /// tombstones alone have crossed their ratio. Must run under the
    /// shard lock; retires the old table through QSBR rather than
    /// freeing it immediately.
    fn maybe_resize(&self, cfg: &DictConfig, qsbr: &Qsbr<K, V>) {
        let table = unsafe { &*self.table_ptr() };
        let capacity = table.capacity();
        let count = self.count.load(Ordering::Relaxed);
        let tombstones = self.tombstones.load(Ordering::Relaxed);
        let load = (count + tombstones) as f64 / capacity as f64;
        let tomb_ratio = tombstones as f64 / capacity as f64;

        let new_capacity = if load > cfg.max_load_factor {
            capacity * 2
        } else if tomb_ratio > cfg.tombstone_ratio {
            capacity
        } else {
            return;
        };

        log::debug!(
            "shard resize: capacity {} -> {} (count={}, tombstones={})",
            capacity,
            new_capacity,
            count,
            tombstones
        );

        let new_table = Table::new(new_capacity, cfg.group_width, cfg.effective_max_probe_groups(new_capacity));
        table.rebuild_into(&new_table);
        let new_ptr = Box::into_raw(Box::new(new_table));
        let old_ptr = self.table.swap(new_ptr, Ordering::Release);
        self.tombstones.store(0, Ordering::Relaxed);
        qsbr.retire(old_ptr);
    }
}

impl<K, V> Drop for Shard<K, V> {
    fn drop(&mut self) {
        // SAFETY: a shard is only dropped once its owning Dictionary is
        // dropped, at which point no reader can be concurrently active.
        unsafe { drop(Box::from_raw(self.table.load(Ordering::Relaxed))) };
    }
}

fn invariant_violation<V>() -> OpResult<V> {
    debug_assert!(false, "find_slot reported no free slot on a table sized for its live set");
    OpResult { value: None, inserted: false, error: Some(crate::error::DictError::InvariantViolation) }
}
