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

//! Hash map based in-memory collaborators
//!
//! For testing only, not for production use

use crate::key::SegmentKey;
use crate::storage::{Body, ReadBody, RemoteStore};
use crate::ReferenceSource;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use stratus_error::{Error, ErrorType::*, Result};

/// Hash map based in-memory object store
///
/// For testing only, not for production use.
pub struct MemStore {
    objects: RwLock<HashMap<(String, SegmentKey), Arc<Vec<u8>>>>,
    gets: AtomicUsize,
}

impl MemStore {
    /// Create a new [MemStore]
    pub fn new() -> Self {
        MemStore {
            objects: RwLock::new(HashMap::new()),
            gets: AtomicUsize::new(0),
        }
    }

    /// Whether an object exists for `key`
    pub fn contains(&self, bucket: &str, key: &SegmentKey) -> bool {
        self.objects
            .read()
            .contains_key(&(bucket.to_string(), *key))
    }

    /// The stored bytes for `key`, if any
    pub fn object(&self, bucket: &str, key: &SegmentKey) -> Option<Arc<Vec<u8>>> {
        self.objects.read().get(&(bucket.to_string(), *key)).cloned()
    }

    /// Seed an object directly, bypassing put()
    pub fn insert(&self, bucket: &str, key: &SegmentKey, body: Vec<u8>) {
        self.objects
            .write()
            .insert((bucket.to_string(), *key), Arc::new(body));
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Number of get() calls served, for asserting fetch coalescing
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

struct CompleteBody {
    body: Arc<Vec<u8>>,
    done: bool,
}

#[async_trait]
impl ReadBody for CompleteBody {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            Ok(None)
        } else {
            self.done = true;
            Ok(Some(Bytes::copy_from_slice(&self.body)))
        }
    }
}

#[async_trait]
impl RemoteStore for MemStore {
    async fn get(&self, bucket: &str, key: &SegmentKey) -> Result<Body> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let body = self
            .objects
            .read()
            .get(&(bucket.to_string(), *key))
            .cloned();
        match body {
            Some(body) => Ok(Box::new(CompleteBody { body, done: false })),
            None => {
                Err(Error::explain(RemoteGetError, format!("no object for {key}")).into_remote())
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &SegmentKey,
        size: u64,
        source: &mut (dyn ReadBody + Send),
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(size as usize);
        while let Some(chunk) = source.read_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        if buf.len() as u64 != size {
            return Err(Error::explain(
                RemotePutError,
                format!("declared {size} bytes, read {}", buf.len()),
            )
            .into_remote());
        }
        self.objects
            .write()
            .insert((bucket.to_string(), *key), Arc::new(buf));
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &SegmentKey) -> Result<()> {
        // deleting an absent key is Ok by contract
        self.objects.write().remove(&(bucket.to_string(), *key));
        Ok(())
    }
}

/// Hash map based reference count source
///
/// For testing only. Unknown keys report zero references.
pub struct MemRefs {
    counts: RwLock<HashMap<SegmentKey, u64>>,
}

impl MemRefs {
    /// Create a new [MemRefs]
    pub fn new() -> Self {
        MemRefs {
            counts: RwLock::new(HashMap::new()),
        }
    }

    /// Set the reference count reported for `key`
    pub fn set(&self, key: &SegmentKey, count: u64) {
        self.counts.write().insert(*key, count);
    }
}

impl Default for MemRefs {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSource for MemRefs {
    fn reference_count(&self, key: &SegmentKey) -> Result<u64> {
        Ok(self.counts.read().get(key).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemStore::new();
        let key = SegmentKey::from_content(b"a");
        store.insert("b", &key, b"hello world".to_vec());

        let mut body = store.get("b", &key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = body.read_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_an_error() {
        let store = MemStore::new();
        let key = SegmentKey::from_content(b"a");
        let err = store.get("b", &key).await.err().unwrap();
        assert_eq!(err.etype(), &RemoteGetError);
        assert_eq!(err.esource(), &stratus_error::ErrorSource::Remote);
    }

    #[tokio::test]
    async fn test_put_size_mismatch() {
        let store = MemStore::new();
        let key = SegmentKey::from_content(b"a");
        let mut body = CompleteBody {
            body: Arc::new(b"four".to_vec()),
            done: false,
        };
        let err = store.put("b", &key, 5, &mut body).await.unwrap_err();
        assert_eq!(err.etype(), &RemotePutError);
        assert!(!store.contains("b", &key));
    }

    #[tokio::test]
    async fn test_delete_absent_is_ok() {
        let store = MemStore::new();
        let key = SegmentKey::from_content(b"a");
        store.delete("b", &key).await.unwrap();

        store.insert("b", &key, vec![1, 2, 3]);
        store.delete("b", &key).await.unwrap();
        assert!(!store.contains("b", &key));
        store.delete("b", &key).await.unwrap();
    }

    #[test]
    fn test_refs_default_to_zero() {
        let refs = MemRefs::new();
        let key = SegmentKey::from_content(b"a");
        assert_eq!(refs.reference_count(&key).unwrap(), 0);
        refs.set(&key, 7);
        assert_eq!(refs.reference_count(&key).unwrap(), 7);
    }
}
