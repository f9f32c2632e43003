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

//! Construction-time configuration for a [`crate::Dictionary`]. This is an
//! in-process builder only — loading configuration from a file or the
//! environment is a neighboring collaborator's job, not this crate's.

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionMode {
    /// Bounded spin, then an unbounded `thread::yield_now` loop.
    SpinOnly,
    /// Bounded spin, then a waiter-counted parking_lot monitor wait.
    SpinThenMonitor,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScheme {
    /// One dedicated, cache-line-spaced lock word per shard.
    Bitset,
    /// A 64x64 grid packed into two words; trades memory for rare,
    /// probabilistic cross-shard false contention.
    Matrix2D,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct DictConfig {
    pub shard_count: usize,
    pub initial_capacity_per_shard: usize,
    pub max_load_factor: f64,
    pub tombstone_ratio: f64,
    pub group_width: usize,
    /// `None` means "total groups in the current table" (recomputed on
    /// every resize); `Some(n)` is a fixed probe bound chosen by the caller.
    pub max_probe_groups: Option<usize>,
    pub spin_iters: u32,
    pub slow_path_iters: u32,
    pub contention_mode: ContentionMode,
    pub lock_scheme: LockScheme,
    pub max_sessions: usize,
    pub enable_combining: bool,
    pub combining_slots: usize,
}

impl Default for DictConfig {
    fn default() -> Self {
        Self {
            shard_count: 256,
            initial_capacity_per_shard: 1024,
            max_load_factor: 0.75,
            tombstone_ratio: 0.20,
            group_width: 16,
            max_probe_groups: None,
            spin_iters: 128,
            slow_path_iters: 4096,
            contention_mode: ContentionMode::SpinThenMonitor,
            lock_scheme: LockScheme::Bitset,
            max_sessions: 256,
            enable_combining: false,
            combining_slots: 64,
        }
        .normalized()
    }
}

fn floor_pow2(x: usize) -> usize {
    if x <= 1 {
        1
    } else {
        1usize << (usize::BITS - 1 - x.leading_zeros())
    }
}

impl DictConfig {
    /// Rounds every option to the shape §4.7 requires: shard count and
    /// per-shard capacity round up to a power of two (capacity floored at
    /// 4); group width rounds *down* to a power of two bounded by capacity;
    /// combining slot count rounds up to a power of two when combining is
    /// enabled.
    pub fn normalized(mut self) -> Self {
        self.shard_count = self.shard_count.max(1).next_power_of_two();
        self.initial_capacity_per_shard = self.initial_capacity_per_shard.max(4).next_power_of_two();
        self.group_width = floor_pow2(self.group_width.max(1)).min(floor_pow2(self.initial_capacity_per_shard));
        if self.enable_combining {
            self.combining_slots = self.combining_slots.max(1).next_power_of_two();
        }
        self
    }

    pub(crate) fn effective_max_probe_groups(&self, capacity: usize) -> usize {
        let total = capacity / self.group_width;
        self.max_probe_groups.map(|n| n.min(total)).unwrap_or(total).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_already_normalized() {
        let cfg = DictConfig::default();
        assert_eq!(cfg.shard_count, 256);
        assert_eq!(cfg.initial_capacity_per_shard, 1024);
        assert_eq!(cfg.group_width, 16);
    }

    #[test]
    fn odd_shard_count_rounds_up() {
        let cfg = DictConfig { shard_count: 100, ..DictConfig::default() }.normalized();
        assert_eq!(cfg.shard_count, 128);
    }

    #[test]
    fn group_width_rounds_down_and_is_capped_by_capacity() {
        let cfg = DictConfig {
            group_width: 31,
            initial_capacity_per_shard: 8,
            ..DictConfig::default()
        }
        .normalized();
        assert_eq!(cfg.group_width, 8);
    }

    #[test]
    fn tiny_capacity_floors_at_four() {
        let cfg = DictConfig { initial_capacity_per_shard: 1, ..DictConfig::default() }.normalized();
        assert_eq!(cfg.initial_capacity_per_shard, 4);
    }

    #[test]
    fn combining_slots_round_up_only_when_enabled() {
        let disabled = DictConfig { enable_combining: false, combining_slots: 50, ..DictConfig::default() }.normalized();
        assert_eq!(disabled.combining_slots, 50);
        let enabled = DictConfig { enable_combining: true, combining_slots: 50, ..DictConfig::default() }.normalized();
        assert_eq!(enabled.combining_slots, 64);
    }

    #[test]
    fn effective_max_probe_groups_defaults_to_total() {
        let cfg = DictConfig { group_width: 16, ..DictConfig::default() }.normalized();
        assert_eq!(cfg.effective_max_probe_groups(1024), 64);
    }
}
