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

//! Reference-count-first, least-recently-used-second eviction planning

use super::{Candidate, EvictionPlanner, EvictionResult};
use crate::key::SegmentKey;

/// The default planner.
///
/// Segments referenced less than the protected one go first, in ascending
/// reference count with the oldest stamp breaking ties. When no such segment
/// exists, recency alone decides among the candidates tied with the
/// protected segment at the minimum count. A lone candidate at that minimum,
/// or a candidate set that is more referenced throughout, cannot be evicted.
///
/// Greedy in priority order; the number of victims is not minimized.
#[derive(Debug, Default)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Planner
    }
}

// pool comes sorted most-evictable first; take until the requirement is met
// or the pool runs dry
fn accumulate(pool: &[&Candidate], needed: u64) -> Vec<SegmentKey> {
    let mut victims = Vec::with_capacity(1); // a shortfall takes at least 1 victim
    let mut freed = 0u64;
    for c in pool {
        if freed >= needed {
            break;
        }
        freed += c.stored_size;
        victims.push(c.key);
    }
    victims
}

impl EvictionPlanner for Planner {
    fn plan(
        &self,
        keep_ref_count: u64,
        candidates: &[Candidate],
        needed: u64,
    ) -> EvictionResult {
        let mut under: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.ref_count < keep_ref_count)
            .collect();
        if !under.is_empty() {
            under.sort_by_key(|c| (c.ref_count, c.last_touched, c.key));
            return EvictionResult::Evict(accumulate(&under, needed));
        }

        // every candidate is at or above the protected segment's count
        let Some(min_count) = candidates.iter().map(|c| c.ref_count).min() else {
            return EvictionResult::Infeasible;
        };
        if min_count != keep_ref_count {
            // the protected segment is the unique minimum holder
            return EvictionResult::Infeasible;
        }
        let mut tied: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.ref_count == min_count)
            .collect();
        if tied.len() < 2 {
            // a lone candidate at the protected count stays put
            return EvictionResult::Infeasible;
        }
        tied.sort_by_key(|c| (c.last_touched, c.key));
        EvictionResult::Evict(accumulate(&tied, needed))
    }
}
