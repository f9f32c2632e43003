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

//! Flat-combining request queue: a contended mutator publishes its request
//! into a slot and waits, instead of spinning for the shard lock itself;
//! whoever does hold the lock drains every ready slot through the same
//! locked-path function a direct caller would use.

use {
    crate::error::DictError,
    std::{
        cell::UnsafeCell,
        mem::MaybeUninit,
        sync::atomic::{AtomicU64, AtomicU8, Ordering},
    },
};

const FREE: u8 = 0;
const PUBLISHING: u8 = 1;
const READY: u8 = 2;
const PROCESSING: u8 = 3;
const DONE: u8 = 4;

/// What a published request asks the executor to do. Carries its own
/// key hash so the drainer never needs to re-hash a key it didn't publish.
pub(crate) enum Op<K, V> {
    TryAdd { key: K, key_hash: u64, source: ValueSource<K, V> },
    GetOrAdd { key: K, key_hash: u64, source: ValueSource<K, V> },
    /// `add` is applied (value or factory-by-key) when the key is absent;
    /// `update` is applied to the existing value when the key is present.
    /// Exactly one of the two ever runs for a given call.
    AddOrUpdate { key: K, key_hash: u64, add: ValueSource<K, V>, update: Box<dyn UpdateExisting<V>> },
    /// `expected: Some(_)` makes this a compare-and-set; `None` updates
    /// unconditionally whenever the key is already present.
    TryUpdate { key: K, key_hash: u64, value: V, expected: Option<V> },
    TryRemove { key: K, key_hash: u64 },
}

impl<K, V> Op<K, V> {
    pub(crate) fn key_hash(&self) -> u64 {
        match self {
            Op::TryAdd { key_hash, .. }
            | Op::GetOrAdd { key_hash, .. }
            | Op::AddOrUpdate { key_hash, .. }
            | Op::TryUpdate { key_hash, .. }
            | Op::TryRemove { key_hash, .. } => *key_hash,
        }
    }
}

/// A direct value or a factory invoked exactly once by the executor thread.
pub(crate) enum ValueSource<K, V> {
    Value(V),
    Factory(Box<dyn UpdateFactory<K, V>>),
}

/// Caller-supplied construction callback for the combining path. Boxed as a
/// trait object since a combine slot must hold it across threads without a
/// generic parameter on the slot type itself.
pub(crate) trait UpdateFactory<K, V>: Send {
    // Declaring `Send` as a supertrait here (rather than writing
    // `Box<dyn UpdateFactory<K, V> + Send>` at every use site) is what
    // makes `Op<K, V>` itself auto-derive `Send`.
    fn call(&mut self, key: &K) -> Result<V, DictError>;
}

impl<K, V, F> UpdateFactory<K, V> for F
where
    F: FnMut(&K) -> Result<V, DictError> + Send,
{
    fn call(&mut self, key: &K) -> Result<V, DictError> {
        self(key)
    }
}

/// The update half of `AddOrUpdate`: invoked with the value currently
/// occupying the slot, producing its replacement.
pub(crate) trait UpdateExisting<V>: Send {
    fn call(&mut self, existing: &V) -> Result<V, DictError>;
}

impl<V, F> UpdateExisting<V> for F
where
    F: FnMut(&V) -> Result<V, DictError> + Send,
{
    fn call(&mut self, existing: &V) -> Result<V, DictError> {
        self(existing)
    }
}

/// What the executor leaves behind for the publisher to collect.
pub(crate) struct OpResult<V> {
    pub value: Option<V>,
    pub inserted: bool,
    pub error: Option<DictError>,
}

impl<V> Default for OpResult<V> {
    fn default() -> Self {
        Self { value: None, inserted: false, error: None }
    }
}

struct Slot<K, V> {
    state: AtomicU8,
    op: UnsafeCell<MaybeUninit<Op<K, V>>>,
    result: UnsafeCell<MaybeUninit<OpResult<V>>>,
}

impl<K, V> Slot<K, V> {
    fn new() -> Self {
        Self { state: AtomicU8::new(FREE), op: UnsafeCell::new(MaybeUninit::uninit()), result: UnsafeCell::new(MaybeUninit::uninit()) }
    }
}

// SAFETY: a slot's `op`/`result` cells are only touched by the publisher
// (while the slot is Free/Publishing, or after it observes Done) or the
// drainer (while the slot is Ready/Processing) — never both at once, per
// the state machine's single-writer-at-a-time discipline.
unsafe impl<K: Send, V: Send> Sync for Slot<K, V> {}

pub(crate) struct CombineQueue<K, V> {
    slots: Box<[Slot<K, V>]>,
    ready_mask: Box<[AtomicU64]>,
    mask: usize,
}

impl<K, V> CombineQueue<K, V> {
    pub(crate) fn new(slot_count: usize) -> Self {
        debug_assert!(slot_count.is_power_of_two());
        let words = (slot_count / 64).max(1);
        Self {
            slots: (0..slot_count).map(|_| Slot::new()).collect(),
            ready_mask: (0..words).map(|_| AtomicU64::new(0)).collect(),
            mask: slot_count - 1,
        }
    }

    fn mark_ready(&self, index: usize) {
        let word = index / 64;
        let bit = 1u64 << (index % 64);
        self.ready_mask[word].fetch_or(bit, Ordering::Release);
    }

    /// Publishes `op` into the first `Free` slot found by linear probe from
    /// a hash-derived start, returning the slot index for `wait`.
    pub(crate) fn publish(&self, start: usize, op: Op<K, V>) -> usize {
        let n = self.slots.len();
        let mut op = Some(op);
        loop {
            for i in 0..n {
                let idx = (start + i) & self.mask;
                let slot = &self.slots[idx];
                if slot.state.compare_exchange(FREE, PUBLISHING, Ordering::AcqRel, Ordering::Relaxed).is_ok() {
                    let taken = op.take().expect("publish loop visits each slot once per attempt");
                    unsafe { (*slot.op.get()).write(taken) };
                    slot.state.store(READY, Ordering::Release);
                    self.mark_ready(idx);
                    return idx;
                }
            }
            // Every slot busy: give the current holder a chance to drain
            // before trying the whole ring again.
            std::thread::yield_now();
        }
    }

    /// Drains every currently-ready slot by running `exec` on its op,
    /// exactly as a direct lock holder would, then marks it `Done`.
    /// Repeats until a full pass finds no newly-ready slots.
    pub(crate) fn drain(&self, mut exec: impl FnMut(Op<K, V>) -> OpResult<V>) {
        loop {
            let mut any = false;
            for (word_idx, word) in self.ready_mask.iter().enumerate() {
                let mut bits = word.swap(0, Ordering::AcqRel);
                while bits != 0 {
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    let idx = word_idx * 64 + bit;
                    if idx >= self.slots.len() {
                        continue;
                    }
                    any = true;
                    let slot = &self.slots[idx];
                    let prev = slot.state.compare_exchange(READY, PROCESSING, Ordering::AcqRel, Ordering::Relaxed);
                    debug_assert!(prev.is_ok(), "combine slot observed Ready->Processing on an unready slot");
                    let op = unsafe { (*slot.op.get()).assume_init_read() };
                    let result = exec(op);
                    unsafe { (*slot.result.get()).write(result) };
                    slot.state.store(DONE, Ordering::Release);
                }
            }
            if !any {
                break;
            }
        }
    }

    /// Spin/yield/sleep until `index`'s slot reaches `Done`, then collects
    /// its result and returns the slot to `Free`.
    pub(crate) fn wait(&self, index: usize, spin_iters: u32) -> OpResult<V> {
        let slot = &self.slots[index];
        for _ in 0..spin_iters {
            if slot.state.load(Ordering::Acquire) == DONE {
                break;
            }
            core::hint::spin_loop();
        }
        let mut yields = 0;
        while slot.state.load(Ordering::Acquire) != DONE {
            if yields < 4 {
                std::thread::yield_now();
                yields += 1;
            } else {
                std::thread::sleep(std::time::Duration::ZERO);
            }
        }
        let result = unsafe { (*slot.result.get()).assume_init_read() };
        let prev = slot.state.compare_exchange(DONE, FREE, Ordering::AcqRel, Ordering::Relaxed);
        debug_assert!(prev.is_ok(), "combine slot observed Done->Free on an already-freed slot");
        result
    }
}
