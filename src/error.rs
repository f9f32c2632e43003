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

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Conceptual fault kinds a mutator can surface. Nothing in this core is
/// retried internally; every variant here means the caller's operation
/// returned without applying a partial change.
pub enum DictError {
    /// find-slot reported no free slot on a table sized for its live set,
    /// or a combine slot attempted an illegal state transition. Indicates
    /// a bug in the core, not caller misuse — `debug_assert!`ed in debug
    /// builds before this variant is ever constructed in release.
    InvariantViolation,
    /// A user-supplied factory (add/update) returned an error. The locked
    /// path already rolled back before this was produced, so the table is
    /// unchanged.
    FactoryFailed,
}

impl fmt::Display for DictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvariantViolation => write!(f, "dictionary invariant violated"),
            Self::FactoryFailed => write!(f, "factory callback failed"),
        }
    }
}

impl std::error::Error for DictError {}
