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

//! Cache eviction planning

use crate::key::SegmentKey;
use crate::timestamp::Timestamp;

pub mod ref_first;

/// One cached segment under consideration for eviction.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub key: SegmentKey,
    /// Live references from the deduplication layer. Supplied input, never
    /// computed here.
    pub ref_count: u64,
    pub last_touched: Timestamp,
    /// Bytes the segment occupies locally, after compression
    pub stored_size: u64,
}

/// The outcome of one planning round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionResult {
    /// Victims to push to the remote store and drop locally, in order
    Evict(Vec<SegmentKey>),
    /// No segment can be evicted without evicting something more referenced
    /// than the protected segment itself. Not an error: the caller falls
    /// back to serving the protected segment without caching it.
    Infeasible,
}

/// The trait that an eviction planning policy needs to implement
///
/// NOTE: these trait methods require &self not &mut self: planners hold no
/// per-call state and may be shared across operations.
pub trait EvictionPlanner {
    /// Choose victims among `candidates` to free at least `needed` bytes.
    ///
    /// `keep_ref_count` is the reference count of the protected segment, the
    /// one whose arrival caused the shortfall; the protected segment itself
    /// must not appear in `candidates`. Victims stop accumulating as soon as
    /// their cumulative stored size meets `needed`. The plan may come up
    /// short when the eligible partition is exhausted first; the caller
    /// applies it and plans again over the reduced candidate set.
    fn plan(
        &self,
        keep_ref_count: u64,
        candidates: &[Candidate],
        needed: u64,
    ) -> EvictionResult;
}
