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

//! Per-shard bit-locks: a `Bitset` (one dedicated bit per shard) or a
//! `Matrix2D` (a 64x64 grid packed into two words, traded for lower memory
//! at the cost of rare cross-shard false contention).

use {
    crate::config::{ContentionMode, LockScheme},
    crossbeam_utils::CachePadded,
    parking_lot::{Condvar, Mutex},
    std::sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

/// Words are stride-spaced one per `CachePadded` cell so adjacent shard
/// locks never share a cache line.
struct LockWord {
    bits: CachePadded<AtomicU64>,
    monitor: Monitor,
}

impl LockWord {
    fn new() -> Self {
        Self { bits: CachePadded::new(AtomicU64::new(0)), monitor: Monitor::new() }
    }
}

/// A waiter-counted mutex/condvar pair used only by the `SpinThenMonitor`
/// slow path; cheap to construct, idle until contention actually occurs.
struct Monitor {
    waiters: AtomicU32,
    gate: Mutex<()>,
    condvar: Condvar,
}

impl Monitor {
    fn new() -> Self {
        Self { waiters: AtomicU32::new(0), gate: Mutex::new(()), condvar: Condvar::new() }
    }

    fn wait(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.gate.lock();
        self.condvar.wait(&mut guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn pulse_if_waiting(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.gate.lock();
            self.condvar.notify_all();
        }
    }
}

/// Handle identifying one bit within one lock word, returned by both
/// schemes' `try_acquire` so callers don't need to know which scheme is in
/// play to release what they hold.
pub(crate) struct LockToken {
    word: usize,
    bit: u32,
    /// Matrix2D acquires a second (column) word; `None` for Bitset.
    second: Option<(usize, u32)>,
}

pub(crate) enum ShardLocks {
    Bitset(BitsetLocks),
    Matrix2D(MatrixLocks),
}

impl ShardLocks {
    pub(crate) fn new(scheme: LockScheme, shard_count: usize) -> Self {
        match scheme {
            LockScheme::Bitset => ShardLocks::Bitset(BitsetLocks::new(shard_count)),
            LockScheme::Matrix2D => ShardLocks::Matrix2D(MatrixLocks::new()),
        }
    }

    /// Both schemes key their lock purely off `shard`: every key hashing
    /// into the same shard must contend for the same lock, since that lock
    /// is what serializes `Shard::apply_and_maybe_resize` (src/shard.rs).
    pub(crate) fn try_acquire(&self, shard: usize) -> Option<LockToken> {
        match self {
            ShardLocks::Bitset(l) => l.try_acquire(shard),
            ShardLocks::Matrix2D(l) => l.try_acquire(shard),
        }
    }

    /// Bounded spin (with a CPU-pause hint), then a configured slow path, as
    /// specified in §4.4.
    pub(crate) fn acquire_blocking(&self, shard: usize, spin_iters: u32, mode: ContentionMode) -> LockToken {
        for _ in 0..spin_iters {
            if let Some(token) = self.try_acquire(shard) {
                return token;
            }
            core::hint::spin_loop();
        }
        loop {
            if let Some(token) = self.try_acquire(shard) {
                return token;
            }
            match mode {
                ContentionMode::SpinOnly => std::thread::yield_now(),
                ContentionMode::SpinThenMonitor => self.monitor_for(shard).wait(),
            }
        }
    }

    fn monitor_for(&self, shard: usize) -> &Monitor {
        match self {
            ShardLocks::Bitset(l) => &l.words[shard].monitor,
            ShardLocks::Matrix2D(l) => {
                let (row, _) = l.row_col(shard);
                &l.rows[row].monitor
            }
        }
    }

    pub(crate) fn release(&self, token: LockToken) {
        match self {
            ShardLocks::Bitset(l) => l.release(token),
            ShardLocks::Matrix2D(l) => l.release(token),
        }
    }
}

/// One dedicated lock bit per shard, words spaced so false sharing between
/// neighboring shards' bits never happens.
pub(crate) struct BitsetLocks {
    words: Box<[LockWord]>,
}

impl BitsetLocks {
    fn new(shard_count: usize) -> Self {
        Self { words: (0..shard_count).map(|_| LockWord::new()).collect() }
    }

    fn try_acquire(&self, shard: usize) -> Option<LockToken> {
        let bit = 1u64 << (shard as u64 % 64);
        let word = &self.words[shard];
        let prev = word.bits.fetch_or(bit, Ordering::Acquire);
        if prev & bit == 0 {
            Some(LockToken { word: shard, bit: (shard % 64) as u32, second: None })
        } else {
            None
        }
    }

    fn release(&self, token: LockToken) {
        let bit = 1u64 << (token.bit as u64);
        let word = &self.words[token.word];
        word.bits.fetch_and(!bit, Ordering::Release);
        word.monitor.pulse_if_waiting();
    }
}

/// Two 64-bit words form a 64x64 grid of locks; `(row, col)` is derived from
/// a secondary mix of the shard index, so every key that hashes into the
/// same shard always contends for the same `(row, col)` lock.
pub(crate) struct MatrixLocks {
    rows: Box<[LockWord; 64]>,
    cols: Box<[LockWord; 64]>,
}

impl MatrixLocks {
    fn new() -> Self {
        Self {
            rows: Box::new(std::array::from_fn(|_| LockWord::new())),
            cols: Box::new(std::array::from_fn(|_| LockWord::new())),
        }
    }

    fn row_col(&self, shard: usize) -> (usize, usize) {
        let mixed = crate::hash::secondary_mix(shard as u64);
        ((mixed & 0x3f) as usize, ((mixed >> 6) & 0x3f) as usize)
    }

    /// Acquire row then column; on column failure, release the row and
    /// signal its waiters so nobody blocks on a lock we gave back up.
    fn try_acquire(&self, shard: usize) -> Option<LockToken> {
        let (row, col) = self.row_col(shard);
        let row_bit = 1u64 << row;
        let row_word = &self.rows[row];
        let row_prev = row_word.bits.fetch_or(row_bit, Ordering::Acquire);
        if row_prev & row_bit != 0 {
            return None;
        }
        let col_bit = 1u64 << col;
        let col_word = &self.cols[col];
        let col_prev = col_word.bits.fetch_or(col_bit, Ordering::Acquire);
        if col_prev & col_bit != 0 {
            row_word.bits.fetch_and(!row_bit, Ordering::Release);
            row_word.monitor.pulse_if_waiting();
            return None;
        }
        Some(LockToken { word: row, bit: row as u32, second: Some((col, col as u32)) })
    }

    /// Release column then row, the reverse of the acquire order.
    fn release(&self, token: LockToken) {
        if let Some((col_idx, col_bit_idx)) = token.second {
            let col_bit = 1u64 << col_bit_idx;
            self.cols[col_idx].bits.fetch_and(!col_bit, Ordering::Release);
            self.cols[col_idx].monitor.pulse_if_waiting();
        }
        let row_bit = 1u64 << token.bit;
        self.rows[token.word].bits.fetch_and(!row_bit, Ordering::Release);
        self.rows[token.word].monitor.pulse_if_waiting();
    }
}
