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

//! Per-shard open-addressed backing store: a parallel control-byte array
//! and entry array, probed in `group_width`-aligned groups via
//! [`crate::group`].

use {
    crate::{group, hash},
    core::{
        cell::UnsafeCell,
        mem::MaybeUninit,
        ptr,
        sync::atomic::{AtomicU8, Ordering},
    },
};

#[derive(Clone, Copy)]
pub(crate) struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

/// Outcome of a shard-level `find_slot` probe (spec §4.3).
pub(crate) enum FindSlotResult {
    Found(usize),
    Empty { index: usize, used_tombstone: bool },
    /// Every probe group was exhausted without an EMPTY or DELETED slot.
    /// Reaching this on a table sized for its live set is an invariant
    /// violation (spec §7), not an ordinary miss.
    NoFreeSlot,
}

/// What happened to the tombstone count when a slot was vacated (spec §4.3
/// "Tombstone bounce-back on removal").
pub(crate) enum RemoveEffect {
    /// The slot (and possibly a run of previously-DELETED predecessors) was
    /// converted straight to EMPTY; `reclaimed` DELETED slots upstream were
    /// also converted to EMPTY and should be subtracted from the tombstone
    /// counter.
    BecameEmpty { reclaimed: usize },
    /// The slot was marked DELETED; the tombstone counter should increment.
    MarkedTombstone,
}

pub(crate) struct Table<K, V> {
    ctrl: Box<[AtomicU8]>,
    entries: Box<[UnsafeCell<MaybeUninit<Entry<K, V>>>]>,
    capacity: usize,
    mask: usize,
    group_width: usize,
    max_probe_groups: usize,
}

// SAFETY: all cross-thread access to `entries` is gated by the ctrl byte
// protocol (write entry, then release-store ctrl; acquire-load ctrl, then
// read entry), so the table as a whole is safe to share once K, V are.
unsafe impl<K: Send, V: Send> Send for Table<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Table<K, V> {}

impl<K: hash::Pod, V: hash::Pod> Table<K, V> {
    pub(crate) fn new(capacity: usize, group_width: usize, max_probe_groups: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(group_width.is_power_of_two());
        debug_assert!(group_width <= capacity);
        Self {
            ctrl: alloc_ctrl(capacity),
            entries: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            capacity,
            mask: capacity - 1,
            group_width,
            max_probe_groups: max_probe_groups.max(1),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn group_width(&self) -> usize {
        self.group_width
    }

    #[inline]
    fn groups_total(&self) -> usize {
        self.capacity / self.group_width
    }

    /// Relaxed bulk read of one group's ctrl bytes. Any byte a caller then
    /// intends to *act on* (compare keys, mutate) must be re-loaded with
    /// Acquire first; this is only the SIMD-style summary pass.
    fn gather_group(&self, base: usize) -> [u8; 16] {
        let mut buf = [group::EMPTY; 16];
        for (i, slot) in buf.iter_mut().enumerate().take(self.group_width) {
            *slot = self.ctrl[(base + i) & self.mask].load(Ordering::Relaxed);
        }
        buf
    }

    #[inline]
    unsafe fn entry_read(&self, index: usize) -> Entry<K, V> {
        // SAFETY: caller has confirmed (via an Acquire-ordered ctrl read)
        // that this slot is occupied, which happens-after the writer's
        // entry initialization.
        ptr::read((*self.entries[index].get()).as_ptr())
    }

    unsafe fn entry_write(&self, index: usize, entry: Entry<K, V>) {
        // SAFETY: caller holds the shard lock (or owns a freshly-allocated
        // table with no concurrent readers yet).
        (*self.entries[index].get()).write(entry);
    }

    /// Walks up to `max_probe_groups` groups starting at `start_group`,
    /// looking for `key`. See spec §4.3 Find-slot.
    pub(crate) fn find_slot(&self, key: &K, h2: u8, start_group: usize) -> FindSlotResult {
        let groups_total = self.groups_total();
        let mut group_idx = start_group % groups_total;
        let mut first_deleted: Option<usize> = None;
        for _ in 0..self.max_probe_groups.min(groups_total) {
            let base = group_idx * self.group_width;
            let bytes = self.gather_group(base);
            let scan = group::scan(&bytes[..self.group_width], h2);
            for off in scan.match_iter() {
                let idx = (base + off) & self.mask;
                let byte = self.ctrl[idx].load(Ordering::Acquire);
                if byte == h2 {
                    let e = unsafe { self.entry_read(idx) };
                    if hash::bytes_eq(&e.key, key) {
                        return FindSlotResult::Found(idx);
                    }
                }
            }
            if first_deleted.is_none() {
                if let Some(off) = scan.first_deleted() {
                    first_deleted = Some((base + off) & self.mask);
                }
            }
            if let Some(off) = scan.first_empty() {
                let idx = (base + off) & self.mask;
                return match first_deleted {
                    Some(del) => FindSlotResult::Empty { index: del, used_tombstone: true },
                    None => FindSlotResult::Empty { index: idx, used_tombstone: false },
                };
            }
            group_idx = (group_idx + 1) % groups_total;
        }
        match first_deleted {
            Some(idx) => FindSlotResult::Empty { index: idx, used_tombstone: true },
            None => FindSlotResult::NoFreeSlot,
        }
    }

    /// Read-only lookup: no tombstone bookkeeping, stops at the first
    /// EMPTY byte observed in the probe sequence.
    pub(crate) fn lookup(&self, key: &K, h2: u8, start_group: usize) -> Option<V> {
        let groups_total = self.groups_total();
        let mut group_idx = start_group % groups_total;
        for _ in 0..self.max_probe_groups.min(groups_total) {
            let base = group_idx * self.group_width;
            let bytes = self.gather_group(base);
            let scan = group::scan(&bytes[..self.group_width], h2);
            for off in scan.match_iter() {
                let idx = (base + off) & self.mask;
                let byte = self.ctrl[idx].load(Ordering::Acquire);
                if byte == h2 {
                    let e = unsafe { self.entry_read(idx) };
                    if hash::bytes_eq(&e.key, key) {
                        return Some(e.value);
                    }
                }
            }
            if scan.first_empty().is_some() {
                return None;
            }
            group_idx = (group_idx + 1) % groups_total;
        }
        None
    }

    /// Writes entry fields, then publishes the H2 byte with Release
    /// ordering (spec §4.3 Insert-at).
    ///
    /// # Safety
    /// Caller must hold the shard lock and `index` must be the position a
    /// prior `find_slot`/probe identified as free.
    pub(crate) unsafe fn insert_at(&self, index: usize, key: K, value: V, h2: u8) {
        self.entry_write(index, Entry { key, value });
        self.ctrl[index].store(h2, Ordering::Release);
    }

    /// Overwrites an occupied slot's value in place (TryUpdate / the update
    /// half of AddOrUpdate). Does not touch the ctrl byte.
    ///
    /// # Safety
    /// Caller must hold the shard lock and `index` must currently be
    /// occupied.
    pub(crate) unsafe fn overwrite_value_at(&self, index: usize, value: V) {
        let key = (*self.entries[index].get()).assume_init_ref().key;
        self.entry_write(index, Entry { key, value });
    }

    /// Reads an occupied slot's current value without modifying it.
    ///
    /// # Safety
    /// Caller must hold the shard lock (or equivalent exclusion) and
    /// `index` must currently be occupied.
    pub(crate) unsafe fn value_at(&self, index: usize) -> V {
        (*self.entries[index].get()).assume_init_ref().value
    }

    /// Removes the occupied slot at `index`, applying the tombstone
    /// bounce-back rule (spec §4.3).
    ///
    /// # Safety
    /// Caller must hold the shard lock and `index` must currently be
    /// occupied.
    pub(crate) unsafe fn remove_at(&self, index: usize) -> (V, RemoveEffect) {
        let entry = self.entry_read(index);
        let next = (index + 1) & self.mask;
        let next_is_empty = self.ctrl[next].load(Ordering::Relaxed) == group::EMPTY;
        if next_is_empty {
            self.ctrl[index].store(group::EMPTY, Ordering::Release);
            let mut reclaimed = 0usize;
            let mut i = index;
            loop {
                let prev = i.wrapping_sub(1) & self.mask;
                if self.ctrl[prev].load(Ordering::Relaxed) == group::DELETED {
                    self.ctrl[prev].store(group::EMPTY, Ordering::Release);
                    reclaimed += 1;
                    i = prev;
                } else {
                    break;
                }
            }
            (entry.value, RemoveEffect::BecameEmpty { reclaimed })
        } else {
            self.ctrl[index].store(group::DELETED, Ordering::Release);
            (entry.value, RemoveEffect::MarkedTombstone)
        }
    }

    /// Reinserts every occupied slot of `self` into a freshly allocated
    /// `new` table (spec §4.3 Resize). `new` must have no prior occupants.
    pub(crate) fn rebuild_into(&self, new: &Table<K, V>) {
        for i in 0..self.capacity {
            let byte = self.ctrl[i].load(Ordering::Relaxed);
            if group::is_full(byte) {
                let e = unsafe { self.entry_read(i) };
                let h = hash::hash_key(&e.key);
                let h2 = hash::h2(h);
                let group_idx = hash::initial_group(h, new.group_width, new.capacity);
                new.raw_insert_fresh(e, h2, group_idx);
            }
        }
    }

    /// Inserts into the first EMPTY slot found starting at `start_group`.
    /// Only valid for a table known to contain no duplicate of this key
    /// (i.e. a freshly allocated resize target).
    fn raw_insert_fresh(&self, entry: Entry<K, V>, h2: u8, start_group: usize) {
        let groups_total = self.groups_total();
        let mut group_idx = start_group % groups_total;
        for _ in 0..groups_total {
            let base = group_idx * self.group_width;
            let bytes = self.gather_group(base);
            let scan = group::scan(&bytes[..self.group_width], h2);
            if let Some(off) = scan.first_empty() {
                let idx = (base + off) & self.mask;
                unsafe { self.insert_at(idx, entry.key, entry.value, h2) };
                return;
            }
            group_idx = (group_idx + 1) % groups_total;
        }
        unreachable!("logic: resize target undersized for its source table's live set");
    }
}

fn alloc_ctrl(capacity: usize) -> Box<[AtomicU8]> {
    use std::alloc::{alloc, handle_alloc_error, Layout};
    debug_assert!(capacity > 0);
    let layout = Layout::array::<u8>(capacity).expect("capacity overflow");
    unsafe {
        let ptr = alloc(layout);
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        ptr::write_bytes(ptr, group::EMPTY, capacity);
        // SAFETY: AtomicU8 has the same size, alignment and bit-validity as
        // u8, so a block filled with `group::EMPTY` bytes is a valid
        // `[AtomicU8]` of all-EMPTY cells. `Box` reclaims this allocation
        // with the same global allocator and an equivalent layout on drop.
        Box::from_raw(ptr::slice_from_raw_parts_mut(ptr as *mut AtomicU8, capacity))
    }
}

#[cfg(test)]
mod tests;
