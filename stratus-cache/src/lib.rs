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

//! The cache tier of a cloud-backed filesystem.
//!
//! Content-addressed data segments live compressed on fast local media and
//! move to a remote object store when local space runs out. [SegmentCache]
//! decides, per segment access, whether data lives locally or remotely,
//! accounts for space, and reclaims it by evicting the least valuable
//! segments: least-referenced first, least-recently-used second.
//!
//! A segment is Local or Remote at any instant, never both: once a local
//! copy is confirmed, the remote copy is deleted and local becomes the sole
//! authoritative copy.

#![allow(clippy::new_without_default)]

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stratus_error::{Error, ErrorType::*, OrErr, Result};
use tokio::sync::Mutex;

pub mod accounting;
pub mod codec;
pub mod eviction;
pub mod key;
pub mod lock;
mod memory;
pub mod storage;
pub mod timestamp;

use accounting::SpaceAccountant;
use codec::SegmentCodec;
use eviction::{Candidate, EvictionPlanner, EvictionResult};
use lock::{FetchLock, LockStatus, Locked};
use storage::{FileBody, RemoteStore};
use timestamp::TimestampTracker;

pub use key::SegmentKey;
pub use memory::{MemRefs, MemStore};

/// Where the deduplication layer reports how many live references a segment
/// has.
///
/// The engine consumes reference counts as input; it never computes them.
pub trait ReferenceSource: Send + Sync {
    fn reference_count(&self, key: &SegmentKey) -> Result<u64>;
}

/// Configuration surface consumed at initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the compressed segments and their stamps
    pub cache_dir: PathBuf,
    /// Object store bucket for evicted and streamed-through segments
    pub bucket: String,
    /// Total local cache capacity in bytes
    pub total_bytes: u64,
    /// Bytes already used at startup. `None` scans `cache_dir`, the warm
    /// cache left behind by the previous process.
    #[serde(default)]
    pub used_bytes: Option<u64>,
}

/// How a download was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Served from the local cache
    Hit,
    /// Fetched from the remote store and retained locally
    MissCached,
    /// Fetched and served without caching: no room could be made
    MissPassThrough,
}

impl DownloadOutcome {
    /// For logging and debugging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::MissCached => "miss-cached",
            Self::MissPassThrough => "miss-pass-through",
        }
    }
}

/// Where an upload ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Kept in the local cache, not uploaded; a later download is served
    /// from the cache at no transfer cost
    Cached,
    /// Streamed to the remote store, no local copy kept
    Uploaded,
}

impl UploadOutcome {
    /// For logging and debugging
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Uploaded => "uploaded",
        }
    }
}

// how long waiters trust an in-flight fetch before competing for the permit
const FETCH_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// The public operation surface of the cache tier: download, upload and
/// remove a segment.
///
/// One instance serves one cache directory. Operations may be invoked
/// concurrently: the accounting state and the local-presence check share one
/// mutual-exclusion domain, and a per-key fetch lock coalesces duplicate
/// fetches so unrelated segments do not serialize on the network.
pub struct SegmentCache {
    cache_dir: PathBuf,
    bucket: String,
    accountant: Mutex<SpaceAccountant>,
    stamps: TimestampTracker,
    planner: Box<dyn EvictionPlanner + Send + Sync>,
    remote: Arc<dyn RemoteStore>,
    codec: Arc<dyn SegmentCodec>,
    refs: Arc<dyn ReferenceSource>,
    fetch_lock: FetchLock,
}

impl SegmentCache {
    /// Bring up the cache tier over `conf.cache_dir`.
    ///
    /// The directory is created if missing; with `used_bytes` unset, the
    /// warm segments already present are billed against the capacity.
    pub async fn new(
        conf: CacheConfig,
        remote: Arc<dyn RemoteStore>,
        codec: Arc<dyn SegmentCodec>,
        refs: Arc<dyn ReferenceSource>,
    ) -> Result<SegmentCache> {
        tokio::fs::create_dir_all(&conf.cache_dir)
            .await
            .or_err_with(FileCreateError, || {
                format!("fail to create cache dir {}", conf.cache_dir.display())
            })?;
        let used = match conf.used_bytes {
            Some(n) => n,
            None => scan_used_bytes(&conf.cache_dir).await?,
        };
        debug!(
            "cache tier up: total {} bytes, used {used} bytes",
            conf.total_bytes
        );
        Ok(SegmentCache {
            stamps: TimestampTracker::new(&conf.cache_dir),
            cache_dir: conf.cache_dir,
            bucket: conf.bucket,
            accountant: Mutex::new(SpaceAccountant::new(conf.total_bytes, used)),
            planner: Box::new(eviction::ref_first::Planner::new()),
            remote,
            codec,
            refs,
            fetch_lock: FetchLock::new(FETCH_LOCK_TIMEOUT),
        })
    }

    /// Ensure segment `key`'s bytes are available, decompressed, at `target`
    pub async fn download(&self, target: &Path, key: &SegmentKey) -> Result<DownloadOutcome> {
        loop {
            if self.local_size(key).await?.is_some() {
                debug!("segment {key} found in cache");
                self.stamps.touch(key).await?;
                self.decompress_to(key, target).await?;
                return Ok(DownloadOutcome::Hit);
            }
            match self.fetch_lock.lock(key) {
                Locked::Fetch(permit) => {
                    let result = self.fetch_miss(target, key).await;
                    let status = match &result {
                        Ok(DownloadOutcome::MissCached) => LockStatus::Done,
                        Ok(_) => LockStatus::GiveUp,
                        Err(_) => LockStatus::TransientError,
                    };
                    debug!(
                        "releasing fetch lock for {key}: {}",
                        <&'static str>::from(status)
                    );
                    self.fetch_lock.release(key, permit, status);
                    return result;
                }
                Locked::Wait(handle) => {
                    handle.wait().await;
                    if handle.lock_status() == LockStatus::Timeout {
                        warn!("fetch lock for {key} timed out, competing for the permit");
                    }
                    // re-check the cache, or compete for the permit
                }
            }
        }
    }

    /// Persist the segment sourced from `[offset, offset + len)` of `source`.
    ///
    /// With room locally the compressed bytes stay in the cache and are not
    /// uploaded. Without room they stream straight to the remote store and
    /// no local copy is kept.
    pub async fn upload(
        &self,
        source: &Path,
        offset: u64,
        key: &SegmentKey,
        len: u64,
    ) -> Result<UploadOutcome> {
        if self.local_size(key).await?.is_some() {
            // already cached: same key, same bytes. Re-billing the segment
            // would corrupt the space ledger; refreshing recency is all
            // that is left to do.
            self.stamps.touch(key).await?;
            return Ok(UploadOutcome::Cached);
        }
        let compressed = self.compress_into(source, offset, len, key).await?;

        let mut accountant = self.accountant.lock().await;
        if !accountant.has_room(compressed) {
            debug!(
                "remaining space {} cannot hold {compressed} bytes, uploading {key}",
                accountant.remaining()
            );
            let path = self.segment_path(key);
            let mut body = FileBody::open(&path).await?;
            self.remote.put(&self.bucket, key, compressed, &mut body).await?;
            drop(body);
            self.remove_local_bytes(key).await?;
            Ok(UploadOutcome::Uploaded)
        } else {
            self.stamps.touch(key).await?;
            accountant.reserve(compressed);
            debug!(
                "segment {key} cached, {compressed} bytes, remaining {}",
                accountant.remaining()
            );
            Ok(UploadOutcome::Cached)
        }
    }

    /// Delete segment `key` wherever it lives.
    ///
    /// Removing a key that exists in neither location is a no-op: absence is
    /// the terminal state either way.
    pub async fn remove(&self, key: &SegmentKey) -> Result<()> {
        let mut accountant = self.accountant.lock().await;
        match self.local_size(key).await? {
            Some(size) => {
                self.remove_local_bytes(key).await?;
                accountant.release(size)?;
                debug!(
                    "removed cached segment {key}, {size} bytes, remaining {}",
                    accountant.remaining()
                );
            }
            None => {
                drop(accountant);
                debug!("segment {key} not in cache, deleting remote object");
                self.remote.delete(&self.bucket, key).await?;
            }
        }
        Ok(())
    }

    /// Bytes still available in the local cache; negative only transiently
    /// inside an operation
    pub async fn remaining_space(&self) -> i64 {
        self.accountant.lock().await.remaining()
    }

    /// Total local cache capacity in bytes
    pub async fn total_space(&self) -> u64 {
        self.accountant.lock().await.total()
    }

    fn segment_path(&self, key: &SegmentKey) -> PathBuf {
        self.cache_dir.join(key.to_string())
    }

    // stored size of the local copy, None when the segment is not cached
    async fn local_size(&self, key: &SegmentKey) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.segment_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Error::e_because(FileStatError, format!("fail to stat segment {key}"), e),
        }
    }

    // the caller holds the fetch permit for this key
    async fn fetch_miss(&self, target: &Path, key: &SegmentKey) -> Result<DownloadOutcome> {
        debug!("segment {key} not found in cache, fetching");
        let cache_file = self.segment_path(key);
        let part = self.cache_dir.join(format!("{key}.part"));
        let mut body = self.remote.get(&self.bucket, key).await?;
        let size = storage::drain_to_file(&part, body.as_mut()).await?;
        drop(body);
        tokio::fs::rename(&part, &cache_file)
            .await
            .or_err(FileWriteError, "fail to move fetched segment into place")?;
        debug!("segment {key} fetched, {size} bytes");

        let mut accountant = self.accountant.lock().await;
        accountant.reserve(size);
        if accountant.is_over_budget() {
            debug!(
                "remaining space {} below zero, starting eviction",
                accountant.remaining()
            );
            if !self.make_room(&mut accountant, key).await? {
                // nothing can be evicted without hurting a more valuable
                // segment: serve this one without caching it
                accountant.release(size)?;
                drop(accountant);
                debug!("cannot evict any segments, pass-through for {key}");
                self.decompress_to(key, target).await?;
                self.remove_local_bytes(key).await?;
                return Ok(DownloadOutcome::MissPassThrough);
            }
            debug!("eviction finished, remaining {}", accountant.remaining());
        }
        // retained: the local copy becomes the authoritative one
        self.stamps.touch(key).await?;
        drop(accountant);
        self.remote.delete(&self.bucket, key).await?;
        self.decompress_to(key, target).await?;
        Ok(DownloadOutcome::MissCached)
    }

    // plan and perform evictions until the ledger is back at or above zero.
    // Returns false when the planner reports nothing can be evicted.
    async fn make_room(
        &self,
        accountant: &mut SpaceAccountant,
        keep: &SegmentKey,
    ) -> Result<bool> {
        let keep_ref_count = self.refs.reference_count(keep)?;
        loop {
            let shortfall = accountant.shortfall();
            if shortfall == 0 {
                return Ok(true);
            }
            let candidates = self.collect_candidates(keep).await?;
            match self.planner.plan(keep_ref_count, &candidates, shortfall) {
                EvictionResult::Infeasible => return Ok(false),
                EvictionResult::Evict(victims) => {
                    for victim in &victims {
                        self.evict_one(accountant, victim).await?;
                    }
                    // a partial plan means the eligible partition ran dry;
                    // plan again over what is left
                }
            }
        }
    }

    // every cached segment except `keep`, with its count, stamp and size
    async fn collect_candidates(&self, keep: &SegmentKey) -> Result<Vec<Candidate>> {
        let mut entries = tokio::fs::read_dir(&self.cache_dir)
            .await
            .or_err(FileOpenError, "fail to read cache dir")?;
        let mut candidates = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .or_err(FileReadError, "fail to list cache dir")?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // stamps and partial fetches do not parse as keys
            let Some(key) = SegmentKey::from_hex(name) else {
                continue;
            };
            if key == *keep {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .or_err(FileStatError, "fail to stat eviction candidate")?;
            let last_touched = match self.stamps.read(&key).await {
                Ok(ts) => ts,
                Err(e) => {
                    // a segment without a stamp is a leftover from an aborted
                    // operation; the oldest possible stamp sends it out first
                    warn!("no stamp for cached segment {key}: {e}");
                    0
                }
            };
            let ref_count = self.refs.reference_count(&key)?;
            candidates.push(Candidate {
                key,
                ref_count,
                last_touched,
                stored_size: meta.len(),
            });
        }
        Ok(candidates)
    }

    // push one victim to the remote store, then drop its local bytes
    async fn evict_one(&self, accountant: &mut SpaceAccountant, key: &SegmentKey) -> Result<()> {
        let path = self.segment_path(key);
        let mut body = FileBody::open(&path).await?;
        let size = body.len();
        self.remote.put(&self.bucket, key, size, &mut body).await?;
        drop(body);
        self.remove_local_bytes(key).await?;
        accountant.release(size)?;
        debug!(
            "evicted segment {key}, {size} bytes, remaining {}",
            accountant.remaining()
        );
        Ok(())
    }

    // delete the local bytes and the stamp; the stamp may legitimately be
    // absent (a pass-through fetch is never stamped)
    async fn remove_local_bytes(&self, key: &SegmentKey) -> Result<()> {
        tokio::fs::remove_file(self.segment_path(key))
            .await
            .or_err_with(FileRemoveError, || format!("fail to remove segment {key}"))?;
        self.stamps.remove(key).await
    }

    async fn compress_into(
        &self,
        source: &Path,
        offset: u64,
        len: u64,
        key: &SegmentKey,
    ) -> Result<u64> {
        let codec = self.codec.clone();
        let source = source.to_path_buf();
        let part = self.cache_dir.join(format!("{key}.part"));
        let dest = self.segment_path(key);
        let blocking_part = part.clone();
        let size = tokio::task::spawn_blocking(move || {
            codec.compress(&source, offset, len, &blocking_part)
        })
        .await
        .or_err(InternalError, "async blocking IO failure")??;
        tokio::fs::rename(&part, &dest)
            .await
            .or_err(FileWriteError, "fail to move compressed segment into place")?;
        Ok(size)
    }

    async fn decompress_to(&self, key: &SegmentKey, target: &Path) -> Result<()> {
        let codec = self.codec.clone();
        let source = self.segment_path(key);
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || codec.decompress(&source, &target))
            .await
            .or_err(InternalError, "async blocking IO failure")?
    }
}

// warm-start scan: bill every segment already in the cache directory
async fn scan_used_bytes(dir: &Path) -> Result<u64> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .or_err(FileOpenError, "fail to read cache dir")?;
    let mut used = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .or_err(FileReadError, "fail to list cache dir")?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if SegmentKey::from_hex(name).is_none() {
            continue;
        }
        let meta = entry
            .metadata()
            .await
            .or_err(FileStatError, "fail to stat cached segment")?;
        used += meta.len();
    }
    Ok(used)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::IdentityCodec;

    fn fresh_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(format!("/tmp/test_segment_cache_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Fixture {
        cache: SegmentCache,
        store: Arc<MemStore>,
        refs: Arc<MemRefs>,
        dir: PathBuf,
    }

    impl Fixture {
        // a cache over a fresh directory, an empty store and the identity
        // codec, so stored sizes equal raw sizes
        async fn new(name: &str, total: u64) -> Fixture {
            let _ = env_logger::builder().is_test(true).try_init();
            let dir = fresh_dir(name);
            let store = Arc::new(MemStore::new());
            let refs = Arc::new(MemRefs::new());
            let conf = CacheConfig {
                cache_dir: dir.clone(),
                bucket: "test".into(),
                total_bytes: total,
                used_bytes: None,
            };
            let cache = SegmentCache::new(
                conf,
                store.clone(),
                Arc::new(IdentityCodec),
                refs.clone(),
            )
            .await
            .unwrap();
            Fixture {
                cache,
                store,
                refs,
                dir,
            }
        }

        fn source_file(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.dir.join(format!("src_{name}"));
            std::fs::write(&path, data).unwrap();
            path
        }

        fn is_local(&self, key: &SegmentKey) -> bool {
            self.dir.join(key.to_string()).exists()
        }

        fn is_remote(&self, key: &SegmentKey) -> bool {
            self.store.contains("test", key)
        }

        // a segment is Local XOR Remote XOR absent, never both
        fn assert_exclusive(&self, key: &SegmentKey) {
            assert!(
                !(self.is_local(key) && self.is_remote(key)),
                "segment {key} is both local and remote"
            );
        }

        // remaining == total - sum of currently cached segment sizes
        async fn assert_space_conserved(&self) {
            let used = scan_used_bytes(&self.dir).await.unwrap();
            let total = self.cache.total_space().await;
            assert_eq!(
                self.cache.remaining_space().await,
                total as i64 - used as i64
            );
        }

        // upload `data` under its content key with the given reference count
        async fn upload_bytes(&self, data: &[u8], ref_count: u64) -> (SegmentKey, UploadOutcome) {
            let key = SegmentKey::from_content(data);
            self.refs.set(&key, ref_count);
            let src = self.source_file(&key.to_string(), data);
            let outcome = self
                .cache
                .upload(&src, 0, &key, data.len() as u64)
                .await
                .unwrap();
            (key, outcome)
        }
    }

    #[tokio::test]
    async fn test_upload_with_room_stays_local() {
        let fx = Fixture::new("upload_local", 1000).await;
        let (key, outcome) = fx.upload_bytes(&[7u8; 400], 1).await;

        assert_eq!(outcome, UploadOutcome::Cached);
        assert_eq!(fx.cache.remaining_space().await, 600);
        assert!(fx.is_local(&key));
        // never uploaded when there is room
        assert!(!fx.is_remote(&key));
        fx.assert_exclusive(&key);
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_upload_without_room_streams_to_remote() {
        let fx = Fixture::new("upload_remote", 300).await;
        let (key, outcome) = fx.upload_bytes(&[7u8; 400], 1).await;

        assert_eq!(outcome, UploadOutcome::Uploaded);
        assert_eq!(fx.cache.remaining_space().await, 300);
        assert!(!fx.is_local(&key));
        assert!(fx.is_remote(&key));
        fx.assert_exclusive(&key);
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_upload_same_key_twice_bills_once() {
        let fx = Fixture::new("upload_twice", 1000).await;
        let data = [7u8; 400];
        let (key, _) = fx.upload_bytes(&data, 1).await;
        let (_, outcome) = fx.upload_bytes(&data, 1).await;

        assert_eq!(outcome, UploadOutcome::Cached);
        assert_eq!(fx.cache.remaining_space().await, 600);
        assert!(fx.is_local(&key));
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_second_upload_streams_when_first_fills_the_cache() {
        let fx = Fixture::new("upload_sequence", 1000).await;
        let (key_a, outcome) = fx.upload_bytes(&[1u8; 400], 1).await;
        assert_eq!(outcome, UploadOutcome::Cached);
        assert_eq!(fx.cache.remaining_space().await, 600);

        // 700 bytes do not fit next to A; uploads never evict, so B goes
        // straight to the remote store and local state is unchanged
        let (key_b, outcome) = fx.upload_bytes(&[2u8; 700], 1).await;
        assert_eq!(outcome, UploadOutcome::Uploaded);
        assert_eq!(fx.cache.remaining_space().await, 600);
        assert!(fx.is_local(&key_a));
        assert!(fx.is_remote(&key_b));
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_round_trip_through_cache() {
        let fx = Fixture::new("round_trip_local", 1000).await;
        let data: Vec<u8> = (0..400).map(|i| (i % 256) as u8).collect();
        let (key, outcome) = fx.upload_bytes(&data, 1).await;
        assert_eq!(outcome, UploadOutcome::Cached);

        let target = fx.dir.join("target");
        let outcome = fx.cache.download(&target, &key).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Hit);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_round_trip_through_remote() {
        // too small to cache anything: upload streams remote, download
        // cannot retain and passes through, bytes still come back identical
        let fx = Fixture::new("round_trip_remote", 100).await;
        let data: Vec<u8> = (0..400).map(|i| (i % 251) as u8).collect();
        let (key, outcome) = fx.upload_bytes(&data, 1).await;
        assert_eq!(outcome, UploadOutcome::Uploaded);

        let target = fx.dir.join("target");
        let outcome = fx.cache.download(&target, &key).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::MissPassThrough);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        // pass-through retains nothing and keeps the remote copy
        assert!(!fx.is_local(&key));
        assert!(fx.is_remote(&key));
        assert_eq!(fx.cache.remaining_space().await, 100);
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_download_caches_and_cleans_remote() {
        let fx = Fixture::new("download_cache", 1000).await;
        let data = vec![3u8; 300];
        let key = SegmentKey::from_content(&data);
        fx.refs.set(&key, 1);
        // identity codec: the remote object is the raw bytes
        fx.store.insert("test", &key, data.clone());

        let target = fx.dir.join("target");
        let outcome = fx.cache.download(&target, &key).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::MissCached);
        assert_eq!(std::fs::read(&target).unwrap(), data);
        assert!(fx.is_local(&key));
        // the local copy is authoritative now
        assert!(!fx.is_remote(&key));
        assert_eq!(fx.cache.remaining_space().await, 700);
        fx.assert_exclusive(&key);
        fx.assert_space_conserved().await;

        // second download is a hit, nothing fetched
        let gets_before = fx.store.get_count();
        let outcome = fx.cache.download(&target, &key).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Hit);
        assert_eq!(fx.store.get_count(), gets_before);
    }

    #[tokio::test]
    async fn test_download_evicts_under_referenced_first() {
        let fx = Fixture::new("evict_order", 1000).await;
        // A and B are unreferenced, C is busier; A is the oldest
        let (key_a, _) = fx.upload_bytes(&[1u8; 300], 0).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let (key_b, _) = fx.upload_bytes(&[2u8; 300], 0).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let (key_c, _) = fx.upload_bytes(&[3u8; 300], 1).await;
        assert_eq!(fx.cache.remaining_space().await, 100);

        // D arrives with count 1 and needs 200 more bytes than remain
        let data_d = vec![4u8; 300];
        let key_d = SegmentKey::from_content(&data_d);
        fx.refs.set(&key_d, 1);
        fx.store.insert("test", &key_d, data_d.clone());

        let target = fx.dir.join("target");
        let outcome = fx.cache.download(&target, &key_d).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::MissCached);
        assert_eq!(std::fs::read(&target).unwrap(), data_d);

        // the oldest zero-count segment was enough; everything else stays
        assert!(!fx.is_local(&key_a));
        assert!(fx.is_remote(&key_a));
        assert!(fx.is_local(&key_b));
        assert!(fx.is_local(&key_c));
        assert!(fx.is_local(&key_d));
        assert_eq!(fx.cache.remaining_space().await, 100);
        for key in [&key_a, &key_b, &key_c, &key_d] {
            fx.assert_exclusive(key);
        }
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_download_replans_until_room() {
        let fx = Fixture::new("evict_replan", 1000).await;
        // one small unreferenced segment and two equal-count peers
        let (key_a, _) = fx.upload_bytes(&[1u8; 100], 0).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let (key_b, _) = fx.upload_bytes(&[2u8; 450], 1).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let (key_c, _) = fx.upload_bytes(&[3u8; 450], 1).await;
        assert_eq!(fx.cache.remaining_space().await, 0);

        // D needs 500 bytes: the unreferenced 100 are not enough, the
        // second round falls back to recency among the count-1 peers
        let data_d = vec![4u8; 500];
        let key_d = SegmentKey::from_content(&data_d);
        fx.refs.set(&key_d, 1);
        fx.store.insert("test", &key_d, data_d.clone());

        let target = fx.dir.join("target");
        let outcome = fx.cache.download(&target, &key_d).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::MissCached);

        assert!(fx.is_remote(&key_a));
        assert!(fx.is_remote(&key_b)); // older peer evicted
        assert!(fx.is_local(&key_c));
        assert!(fx.is_local(&key_d));
        assert_eq!(fx.cache.remaining_space().await, 50);
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_download_passes_through_when_infeasible() {
        let fx = Fixture::new("infeasible", 700).await;
        let (key_a, _) = fx.upload_bytes(&[1u8; 400], 1).await;
        assert_eq!(fx.cache.remaining_space().await, 300);

        // B shares A's count; a lone candidate at the protected count
        // cannot be evicted
        let data_b = vec![2u8; 400];
        let key_b = SegmentKey::from_content(&data_b);
        fx.refs.set(&key_b, 1);
        fx.store.insert("test", &key_b, data_b.clone());

        let target = fx.dir.join("target");
        let outcome = fx.cache.download(&target, &key_b).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::MissPassThrough);
        assert_eq!(std::fs::read(&target).unwrap(), data_b);

        // local state unchanged, B still remote
        assert!(fx.is_local(&key_a));
        assert!(!fx.is_local(&key_b));
        assert!(fx.is_remote(&key_b));
        assert_eq!(fx.cache.remaining_space().await, 300);
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_remove_local_releases_space() {
        let fx = Fixture::new("remove_local", 1000).await;
        let (key, _) = fx.upload_bytes(&[1u8; 400], 1).await;
        assert_eq!(fx.cache.remaining_space().await, 600);

        fx.cache.remove(&key).await.unwrap();
        assert!(!fx.is_local(&key));
        assert!(!fx.is_remote(&key));
        assert_eq!(fx.cache.remaining_space().await, 1000);
        fx.assert_space_conserved().await;
    }

    #[tokio::test]
    async fn test_remove_remote() {
        let fx = Fixture::new("remove_remote", 100).await;
        let (key, outcome) = fx.upload_bytes(&[1u8; 400], 1).await;
        assert_eq!(outcome, UploadOutcome::Uploaded);

        fx.cache.remove(&key).await.unwrap();
        assert!(!fx.is_remote(&key));
        assert_eq!(fx.cache.remaining_space().await, 100);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let fx = Fixture::new("remove_idem", 1000).await;
        let (key, _) = fx.upload_bytes(&[1u8; 400], 1).await;

        fx.cache.remove(&key).await.unwrap();
        // removing an absent key succeeds as a no-op
        fx.cache.remove(&key).await.unwrap();
        assert_eq!(fx.cache.remaining_space().await, 1000);

        // a key that never existed anywhere
        let ghost = SegmentKey::from_content(b"never seen");
        fx.cache.remove(&ghost).await.unwrap();
    }

    #[tokio::test]
    async fn test_warm_start_rebills_cached_segments() {
        let dir = fresh_dir("warm_start");
        let store = Arc::new(MemStore::new());
        let refs = Arc::new(MemRefs::new());
        let data = vec![5u8; 400];
        let key = SegmentKey::from_content(&data);
        let conf = CacheConfig {
            cache_dir: dir.clone(),
            bucket: "test".into(),
            total_bytes: 1000,
            used_bytes: None,
        };

        {
            let cache = SegmentCache::new(
                conf.clone(),
                store.clone(),
                Arc::new(IdentityCodec),
                refs.clone(),
            )
            .await
            .unwrap();
            let src = dir.join("src");
            std::fs::write(&src, &data).unwrap();
            cache.upload(&src, 0, &key, data.len() as u64).await.unwrap();
            assert_eq!(cache.remaining_space().await, 600);
        }

        // a new process over the same directory
        let cache = SegmentCache::new(conf, store, Arc::new(IdentityCodec), refs)
            .await
            .unwrap();
        assert_eq!(cache.remaining_space().await, 600);

        // the stamp survived too, so the segment serves as a plain hit
        let target = dir.join("target");
        let outcome = cache.download(&target, &key).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Hit);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_concurrent_downloads_fetch_once() {
        let fx = Fixture::new("coalesce", 10_000).await;
        let data = vec![6u8; 500];
        let key = SegmentKey::from_content(&data);
        fx.refs.set(&key, 1);
        fx.store.insert("test", &key, data.clone());

        let cache = Arc::new(fx.cache);
        let mut tasks = vec![];
        for i in 0..8 {
            let cache = cache.clone();
            let target = fx.dir.join(format!("target_{i}"));
            let expect = data.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = cache.download(&target, &key).await.unwrap();
                assert_eq!(std::fs::read(&target).unwrap(), expect);
                outcome
            }));
        }
        let mut cached = 0;
        for task in tasks {
            match task.await.unwrap() {
                DownloadOutcome::MissCached => cached += 1,
                DownloadOutcome::Hit => {}
                outcome => panic!("unexpected outcome {}", outcome.as_str()),
            }
        }
        // exactly one task fetched, the rest were coalesced into hits
        assert_eq!(cached, 1);
        assert_eq!(fx.store.get_count(), 1);
    }
}
