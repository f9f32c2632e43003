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

//! Quiescent-state-based reclamation of retired shard tables. A reader
//! announces a global epoch into its own padded session slot before
//! dereferencing a shard's table pointer; a retiring writer may destroy a
//! table once every announced epoch has moved past the table's retire
//! epoch.

use {
    crate::table::Table,
    crossbeam_utils::CachePadded,
    parking_lot::Mutex,
    std::{
        cell::Cell,
        collections::HashMap,
        sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

/// `0` means "no reader currently active in this slot".
const SLOT_INACTIVE: u64 = 0;

struct RetiredEntry<K, V> {
    table: *mut Table<K, V>,
    retire_epoch: u64,
}

// SAFETY: a retired table pointer is only ever read by `collect`, which runs
// under `retire_lock` and only dereferences it to drop it; no other thread
// holds a reference to a retired table once it has been swapped out.
unsafe impl<K: Send, V: Send> Send for RetiredEntry<K, V> {}

/// One domain per `Dictionary` instance: a global epoch, a fixed pool of
/// padded reader slots, and the bookkeeping to retire/reclaim old tables.
pub(crate) struct Qsbr<K, V> {
    global_epoch: AtomicU64,
    slots: Box<[CachePadded<AtomicU64>]>,
    slot_taken: Box<[CachePadded<std::sync::atomic::AtomicBool>]>,
    next_slot_hint: AtomicUsize,
    retired: Mutex<Vec<RetiredEntry<K, V>>>,
}

impl<K, V> Qsbr<K, V> {
    pub(crate) fn new(max_sessions: usize) -> Self {
        Self {
            global_epoch: AtomicU64::new(1),
            slots: (0..max_sessions).map(|_| CachePadded::new(AtomicU64::new(SLOT_INACTIVE))).collect(),
            slot_taken: (0..max_sessions)
                .map(|_| CachePadded::new(std::sync::atomic::AtomicBool::new(false)))
                .collect(),
            next_slot_hint: AtomicUsize::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn acquire_slot(&self) -> Option<usize> {
        let n = self.slots.len();
        if n == 0 {
            return None;
        }
        let start = self.next_slot_hint.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let idx = (start + i) % n;
            if self.slot_taken[idx]
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Announces this thread as active at the current global epoch. Returns
    /// `None` if no session slot was available (caller must fall back to
    /// the shard lock for this read instead of the lock-free fast path).
    pub(crate) fn enter_read(&self, session: &ReaderSession) -> bool {
        let Some(idx) = session.resolve(self) else { return false };
        let epoch = self.global_epoch.load(Ordering::Relaxed);
        self.slots[idx].store(epoch, Ordering::Release);
        true
    }

    /// Leaves the announced read without releasing the session slot itself
    /// (the slot is reused by the same thread on its next `enter_read`).
    pub(crate) fn exit_read(&self, session: &ReaderSession) {
        if let Some(idx) = session.current() {
            self.slots[idx].store(SLOT_INACTIVE, Ordering::Release);
        }
    }

    /// Schedules `table` for destruction once no reader can still be
    /// observing it, bumping the global epoch so future readers
    /// unambiguously postdate this retirement.
    pub(crate) fn retire(&self, table: *mut Table<K, V>) {
        let retire_epoch = self.global_epoch.fetch_add(1, Ordering::AcqRel);
        let mut retired = self.retired.lock();
        retired.push(RetiredEntry { table, retire_epoch });
        self.collect_locked(&mut retired);
    }

    fn min_active_epoch(&self) -> u64 {
        let mut min = u64::MAX;
        for (slot, taken) in self.slots.iter().zip(self.slot_taken.iter()) {
            if taken.load(Ordering::Acquire) {
                let e = slot.load(Ordering::Acquire);
                if e != SLOT_INACTIVE && e < min {
                    min = e;
                }
            }
        }
        min
    }

    fn collect_locked(&self, retired: &mut Vec<RetiredEntry<K, V>>) {
        let min_active = self.min_active_epoch();
        let before = retired.len();
        retired.retain(|entry| {
            if entry.retire_epoch < min_active {
                // SAFETY: no reader's announced epoch precedes this table's
                // retirement, so nobody holds a live reference to it.
                unsafe { drop(Box::from_raw(entry.table)) };
                false
            } else {
                true
            }
        });
        let destroyed = before - retired.len();
        if destroyed > 0 {
            log::trace!("qsbr: destroyed {destroyed} retired table(s), {} still pending", retired.len());
        }
    }
}

impl<K, V> Drop for Qsbr<K, V> {
    fn drop(&mut self) {
        // Every retired table is destroyed unconditionally here: by the
        // time the domain itself is dropped, no reader can still be active.
        let mut retired = self.retired.lock();
        for entry in retired.drain(..) {
            unsafe { drop(Box::from_raw(entry.table)) };
        }
    }
}

/// A thread's lazily-resolved, cached session slot for one `Qsbr` domain.
/// Keyed by the domain's address so one thread can hold independent
/// sessions against multiple `Dictionary` instances at once.
pub(crate) struct ReaderSession {
    domain_addr: usize,
    slot: Cell<Option<usize>>,
}

thread_local! {
    static SESSION_CACHE: std::cell::RefCell<HashMap<usize, usize>> = std::cell::RefCell::new(HashMap::new());
}

impl ReaderSession {
    pub(crate) fn for_domain<K, V>(domain: &Qsbr<K, V>) -> Self {
        Self { domain_addr: domain as *const _ as usize, slot: Cell::new(None) }
    }

    fn current(&self) -> Option<usize> {
        self.slot.get()
    }

    fn resolve<K, V>(&self, domain: &Qsbr<K, V>) -> Option<usize> {
        if let Some(idx) = self.slot.get() {
            return Some(idx);
        }
        let cached = SESSION_CACHE.with(|c| c.borrow().get(&self.domain_addr).copied());
        let idx = match cached {
            Some(idx) => idx,
            None => {
                let idx = domain.acquire_slot()?;
                SESSION_CACHE.with(|c| c.borrow_mut().insert(self.domain_addr, idx));
                idx
            }
        };
        self.slot.set(Some(idx));
        Some(idx)
    }
}
