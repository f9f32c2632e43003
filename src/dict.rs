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

//! Public API: a concurrent map from fixed-size keys to fixed-size values.
//!
//! ```
//! use shardmap::{Dictionary, DictConfig};
//!
//! let dict: Dictionary<u64, u64> = Dictionary::with_defaults();
//! dict.try_add(1, 100);
//! assert_eq!(dict.try_get(&1), Some(100));
//! let _ = DictConfig::default();
//! ```

use crate::{
    combine::{Op, OpResult, UpdateExisting, ValueSource},
    config::DictConfig,
    error::DictError,
    hash::{self, Pod},
    lock::{LockToken, ShardLocks},
    qsbr::{Qsbr, ReaderSession},
    shard::Shard,
};

/// A concurrent, sharded hash map over fixed-size (`Pod`) keys and values.
pub struct Dictionary<K, V> {
    cfg: DictConfig,
    shards: Box<[Shard<K, V>]>,
    locks: ShardLocks,
    qsbr: Qsbr<K, V>,
}

impl<K: Pod, V: Pod> Dictionary<K, V> {
    pub fn new(cfg: DictConfig) -> Self {
        let cfg = cfg.normalized();
        let shards = (0..cfg.shard_count).map(|_| Shard::new(&cfg)).collect();
        let locks = ShardLocks::new(cfg.lock_scheme, cfg.shard_count);
        let qsbr = Qsbr::new(cfg.max_sessions);
        log::debug!(
            "dictionary created: {} shards x {} slots, combining={}",
            cfg.shard_count,
            cfg.initial_capacity_per_shard,
            cfg.enable_combining
        );
        Self { cfg, shards, locks, qsbr }
    }

    pub fn with_defaults() -> Self {
        Self::new(DictConfig::default())
    }

    fn shard_and_hash(&self, key: &K) -> (usize, u64) {
        let h = hash::hash_key(key);
        (hash::shard_index(h, self.cfg.shard_count), h)
    }

    /// Non-blocking, epoch-protected read. Falls back to taking the shard
    /// lock only when no QSBR session slot is available.
    pub fn try_get(&self, key: &K) -> Option<V> {
        let (shard_idx, h) = self.shard_and_hash(key);
        let shard = &self.shards[shard_idx];
        let session = ReaderSession::for_domain(&self.qsbr);
        if self.qsbr.enter_read(&session) {
            let result = shard.lookup(key, h);
            self.qsbr.exit_read(&session);
            result
        } else {
            let token = self.acquire(shard_idx);
            let result = shard.lookup(key, h);
            self.release(shard_idx, token);
            result
        }
    }

    pub fn try_add(&self, key: K, value: V) -> bool {
        let (shard_idx, h) = self.shard_and_hash(&key);
        self.dispatch(shard_idx, Op::TryAdd { key, key_hash: h, source: ValueSource::Value(value) }).inserted
    }

    pub fn try_add_with_factory(&self, key: K, factory: impl FnMut(&K) -> Result<V, DictError> + Send + 'static) -> Result<bool, DictError> {
        let (shard_idx, h) = self.shard_and_hash(&key);
        let result = self.dispatch(shard_idx, Op::TryAdd { key, key_hash: h, source: ValueSource::Factory(Box::new(factory)) });
        match result.error {
            Some(e) => Err(e),
            None => Ok(result.inserted),
        }
    }

    pub fn get_or_add(&self, key: K, value: V) -> V {
        let (shard_idx, h) = self.shard_and_hash(&key);
        self.dispatch(shard_idx, Op::GetOrAdd { key, key_hash: h, source: ValueSource::Value(value) })
            .value
            .expect("GetOrAdd always produces a value")
    }

    pub fn get_or_add_with_factory(&self, key: K, factory: impl FnMut(&K) -> Result<V, DictError> + Send + 'static) -> Result<V, DictError> {
        let (shard_idx, h) = self.shard_and_hash(&key);
        let result = self.dispatch(shard_idx, Op::GetOrAdd { key, key_hash: h, source: ValueSource::Factory(Box::new(factory)) });
        match result.error {
            Some(e) => Err(e),
            None => Ok(result.value.expect("GetOrAdd always produces a value on success")),
        }
    }

    /// Applies `update(existing)` under the shard lock if `key` is already
    /// present, else inserts `add_value`. Returns the value now stored.
    pub fn add_or_update(&self, key: K, add_value: V, mut update: impl FnMut(&V) -> V + Send + 'static) -> V {
        let (shard_idx, h) = self.shard_and_hash(&key);
        let update: Box<dyn UpdateExisting<V>> = Box::new(move |existing: &V| Ok(update(existing)));
        self.dispatch(shard_idx, Op::AddOrUpdate { key, key_hash: h, add: ValueSource::Value(add_value), update })
            .value
            .expect("AddOrUpdate always produces a value")
    }

    /// Factory variant of [`Self::add_or_update`]: `add_factory(&key)` is
    /// invoked on insert, `update_factory(&existing)` on update; either may
    /// fail, and the failure is propagated without mutating the table.
    pub fn add_or_update_with_factory(
        &self,
        key: K,
        add_factory: impl FnMut(&K) -> Result<V, DictError> + Send + 'static,
        update_factory: impl FnMut(&V) -> Result<V, DictError> + Send + 'static,
    ) -> Result<V, DictError> {
        let (shard_idx, h) = self.shard_and_hash(&key);
        let result = self.dispatch(
            shard_idx,
            Op::AddOrUpdate {
                key,
                key_hash: h,
                add: ValueSource::Factory(Box::new(add_factory)),
                update: Box::new(update_factory),
            },
        );
        match result.error {
            Some(e) => Err(e),
            None => Ok(result.value.expect("AddOrUpdate always produces a value on success")),
        }
    }

    /// Unconditional update of an existing key; returns the prior value, or
    /// `None` if the key was absent (in which case nothing is applied).
    pub fn try_update(&self, key: K, value: V) -> Option<V> {
        let (shard_idx, h) = self.shard_and_hash(&key);
        self.dispatch(shard_idx, Op::TryUpdate { key, key_hash: h, value, expected: None }).value
    }

    /// Compare-and-set: applies `value` only if the current value equals
    /// `expected` (bytewise). Returns the value observed at the key,
    /// regardless of whether the update was applied; `None` if absent.
    pub fn try_update_cas(&self, key: K, expected: V, value: V) -> Option<V> {
        let (shard_idx, h) = self.shard_and_hash(&key);
        self.dispatch(shard_idx, Op::TryUpdate { key, key_hash: h, value, expected: Some(expected) }).value
    }

    pub fn try_remove(&self, key: &K) -> Option<V> {
        let (shard_idx, h) = self.shard_and_hash(key);
        self.dispatch(shard_idx, Op::TryRemove { key: *key, key_hash: h }).value
    }

    /// Advisory snapshot: sum of each shard's relaxed live-entry counter.
    pub fn count(&self) -> usize {
        self.shards.iter().map(Shard::count).sum()
    }

    /// Advisory snapshot: sum of each shard's current table capacity.
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(Shard::capacity).sum()
    }

    fn acquire(&self, shard_idx: usize) -> LockToken {
        self.locks.acquire_blocking(shard_idx, self.cfg.spin_iters, self.cfg.contention_mode)
    }

    fn release(&self, shard_idx: usize, token: LockToken) {
        let _ = shard_idx;
        self.locks.release(token);
    }

    /// Compute hash/shard/H2 already done by the caller; from here:
    /// if combining is enabled, try the lock non-blocking and drain the
    /// queue on success, else publish a request and wait on it; if
    /// combining is disabled, acquire the lock blocking and run directly.
    fn dispatch(&self, shard_idx: usize, op: Op<K, V>) -> OpResult<V> {
        let shard = &self.shards[shard_idx];
        let key_hash = op.key_hash();
        match &shard.combine {
            Some(queue) => match self.locks.try_acquire(shard_idx) {
                Some(token) => {
                    let result = shard.apply_and_maybe_resize(&self.cfg, &self.qsbr, op);
                    queue.drain(|queued| shard.apply_and_maybe_resize(&self.cfg, &self.qsbr, queued));
                    self.locks.release(token);
                    result
                }
                None => {
                    log::trace!("combining: shard {shard_idx} busy, publishing request");
                    let start = (key_hash as usize) & (self.cfg.combining_slots - 1);
                    let idx = queue.publish(start, op);
                    queue.wait(idx, self.cfg.slow_path_iters)
                }
            },
            None => {
                let token = self.acquire(shard_idx);
                let result = shard.apply_and_maybe_resize(&self.cfg, &self.qsbr, op);
                self.release(shard_idx, token);
                result
            }
        }
    }
}
