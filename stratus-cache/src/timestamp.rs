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

//! Per-segment last-touched stamps
//!
//! Each cached segment carries one piece of out-of-band metadata, the time it
//! was last read or written. The stamp is persisted in a sidecar file next to
//! the cached bytes so that recency ordering survives process restart.

use crate::key::SegmentKey;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use stratus_error::{ErrorType::*, OrErr, Result};

/// Microseconds since the Unix epoch.
///
/// Wall clock, monotonic enough for recency ordering; the eviction planner
/// breaks equal stamps deterministically by key.
pub type Timestamp = u64;

const STAMP_SUFFIX: &str = "stamp";

#[derive(Debug, Deserialize, Serialize)]
struct Stamp {
    last_touched: Timestamp,
}

/// Reads and writes the `<key>.stamp` sidecars in the cache directory.
pub struct TimestampTracker {
    cache_dir: PathBuf,
}

impl TimestampTracker {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        TimestampTracker {
            cache_dir: cache_dir.into(),
        }
    }

    /// The current wall clock reading
    pub fn now() -> Result<Timestamp> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .or_err(InternalError, "system clock before the epoch")?;
        Ok(elapsed.as_micros() as u64)
    }

    fn stamp_path(&self, key: &SegmentKey) -> PathBuf {
        self.cache_dir.join(format!("{key}.{STAMP_SUFFIX}"))
    }

    /// Stamp `key` with the current time and persist it.
    ///
    /// A stamp that cannot be persisted is a hard error for the calling
    /// operation: proceeding with stale ordering data corrupts eviction
    /// fairness.
    pub async fn touch(&self, key: &SegmentKey) -> Result<Timestamp> {
        let now = Self::now()?;
        let buf = rmp_serde::to_vec(&Stamp { last_touched: now })
            .or_err(MetadataWriteError, "fail to encode stamp")?;
        tokio::fs::write(self.stamp_path(key), buf)
            .await
            .or_err_with(MetadataWriteError, || {
                format!("fail to write stamp for segment {key}")
            })?;
        Ok(now)
    }

    /// Load the persisted stamp for `key`
    pub async fn read(&self, key: &SegmentKey) -> Result<Timestamp> {
        let buf = tokio::fs::read(self.stamp_path(key))
            .await
            .or_err_with(MetadataReadError, || {
                format!("fail to read stamp for segment {key}")
            })?;
        let stamp: Stamp =
            rmp_serde::from_slice(&buf).or_err(MetadataReadError, "fail to decode stamp")?;
        Ok(stamp.last_touched)
    }

    /// Drop the stamp for `key`. Removing an absent stamp is fine: the
    /// segment may never have been retained.
    pub async fn remove(&self, key: &SegmentKey) -> Result<()> {
        match tokio::fs::remove_file(self.stamp_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(stratus_error::Error::because(
                MetadataWriteError,
                format!("fail to remove stamp for segment {key}"),
                e,
            )),
        }
    }
}
