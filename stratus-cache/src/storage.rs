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

//! Remote object store boundary

use crate::key::SegmentKey;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use stratus_error::{Error, ErrorType::*, OrErr, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Pull-based chunk stream, the body of one object transfer.
///
/// Whoever holds the body owns the underlying handle for the duration of the
/// transfer; dropping it on any exit path, including early failure, releases
/// the handle.
#[async_trait]
pub trait ReadBody {
    /// Read the next chunk
    ///
    /// Return `None` when no more body to read.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Boxed body, how streams cross the store seam
pub type Body = Box<dyn ReadBody + Send>;

/// Remote object store interface
///
/// Keyed by the same content-hash key space as the local cache. Errors
/// surface to the caller as-is: retry policy belongs to the store client,
/// not to this engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the object for `key`, returning its body stream
    async fn get(&self, bucket: &str, key: &SegmentKey) -> Result<Body>;

    /// Store `size` bytes pulled from `source` under `key`
    async fn put(
        &self,
        bucket: &str,
        key: &SegmentKey,
        size: u64,
        source: &mut (dyn ReadBody + Send),
    ) -> Result<()>;

    /// Delete the object for `key`.
    ///
    /// Deleting an absent key is Ok: removal treats absence as the terminal
    /// state either way.
    async fn delete(&self, bucket: &str, key: &SegmentKey) -> Result<()>;
}

const CHUNK_SIZE: usize = 64 * 1024;

/// Chunked reader over one local file, the producer half of a push to the
/// remote store.
pub struct FileBody {
    file: File,
    len: u64,
    remaining: u64,
}

impl FileBody {
    /// Open `path` and stream its entire contents
    pub async fn open(path: &Path) -> Result<FileBody> {
        let file = File::open(path)
            .await
            .or_err_with(FileOpenError, || format!("fail to open {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .or_err_with(FileStatError, || format!("fail to stat {}", path.display()))?
            .len();
        Ok(FileBody {
            file,
            len,
            remaining: len,
        })
    }

    /// Total bytes this body will produce
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[async_trait]
impl ReadBody for FileBody {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let want = CHUNK_SIZE.min(self.remaining as usize);
        let mut buf = vec![0u8; want];
        let n = self
            .file
            .read(&mut buf)
            .await
            .or_err(FileReadError, "fail to read local segment")?;
        if n == 0 {
            // the file shrank under us mid transfer
            return Error::e_explain(FileReadError, "local segment truncated during push");
        }
        buf.truncate(n);
        self.remaining -= n as u64;
        Ok(Some(buf.into()))
    }
}

/// Drain `body` into a fresh local file at `path`, returning the bytes
/// written, which is the stored size the accountant bills.
pub(crate) async fn drain_to_file(path: &Path, body: &mut (dyn ReadBody + Send)) -> Result<u64> {
    let mut file = File::create(path)
        .await
        .or_err_with(FileCreateError, || {
            format!("fail to create {}", path.display())
        })?;
    let mut written = 0u64;
    while let Some(chunk) = body.read_chunk().await? {
        file.write_all(&chunk)
            .await
            .or_err(FileWriteError, "fail to write fetched segment")?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .or_err(FileWriteError, "fail to flush fetched segment")?;
    Ok(written)
}
