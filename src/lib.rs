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

//! A sharded, open-addressed concurrent hash map with SIMD-assisted
//! control-byte probing, per-shard bit-locks, opt-in flat-combining for
//! contended mutators, and QSBR-based reclamation of retired shard tables
//! across resizes.
//!
//! Keys and values are fixed-size, `Copy` types (see [`Pod`]) compared and
//! hashed structurally; there is no ordered iteration, no range scan, and
//! no persistence — this is an in-memory point-access table only.

mod combine;
mod config;
mod dict;
mod error;
mod group;
mod hash;
mod lock;
mod qsbr;
mod shard;
mod table;

pub use config::{ContentionMode, DictConfig, LockScheme};
pub use dict::Dictionary;
pub use error::DictError;
pub use hash::Pod;
