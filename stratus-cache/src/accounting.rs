// Copyright 2026 Stratus Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Local cache space accounting

use stratus_error::{Error, ErrorType::*, Result};

/// The single source of truth for "is there room" in the local cache.
///
/// Pure bookkeeping, no I/O. The accountant does no locking of its own: the
/// gateway owns the critical section that covers the presence check and the
/// reservation together.
///
/// `remaining` may go negative right after a local write lands (the write
/// happens before the accounting check), but every operation restores it to
/// at or above zero before returning, by eviction or by reversing the write.
#[derive(Debug)]
pub struct SpaceAccountant {
    total: u64,
    remaining: i64,
}

impl SpaceAccountant {
    /// Create an accountant for `total` capacity with `used` bytes already
    /// occupied, e.g. by a warm cache directory.
    pub fn new(total: u64, used: u64) -> Self {
        SpaceAccountant {
            total,
            remaining: total as i64 - used as i64,
        }
    }

    /// Bill `bytes` against the remaining capacity
    pub fn reserve(&mut self, bytes: u64) {
        self.remaining -= bytes as i64;
    }

    /// Return `bytes` to the remaining capacity.
    ///
    /// Releasing more than was ever reserved means the space ledger is
    /// already corrupt, which must surface rather than be absorbed.
    pub fn release(&mut self, bytes: u64) -> Result<()> {
        let remaining = self.remaining + bytes as i64;
        if remaining > self.total as i64 {
            return Error::e_explain(
                AccountingError,
                format!(
                    "released {bytes} bytes, remaining {remaining} exceeds total {}",
                    self.total
                ),
            );
        }
        self.remaining = remaining;
        Ok(())
    }

    /// Whether `bytes` more can be stored without going over capacity
    pub fn has_room(&self, bytes: u64) -> bool {
        self.remaining >= bytes as i64
    }

    /// Whether more bytes are billed than the capacity holds
    pub fn is_over_budget(&self) -> bool {
        self.remaining < 0
    }

    /// How many bytes must be freed to get back to budget, zero when within it
    pub fn shortfall(&self) -> u64 {
        if self.remaining < 0 {
            -self.remaining as u64
        } else {
            0
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    pub fn used(&self) -> i64 {
        self.total as i64 - self.remaining
    }
}
