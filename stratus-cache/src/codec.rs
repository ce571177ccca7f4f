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

//! Segment compression codec

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use stratus_error::{Error, ErrorType::*, OkOrErr, OrErr, Result};
use thread_local::ThreadLocal;
use zstd_safe::{CCtx, DCtx};

/// Compression codec interface
///
/// The calls block: the gateway runs them on the blocking thread pool. The
/// only determinism required is that `decompress(compress(x))` reproduces
/// the byte range exactly.
pub trait SegmentCodec: Send + Sync {
    /// Compress `[offset, offset + len)` of `source` into `dest`.
    ///
    /// Returns the compressed size, the unit the space accountant bills.
    fn compress(&self, source: &Path, offset: u64, len: u64, dest: &Path) -> Result<u64>;

    /// Decompress `source` into `dest`
    fn decompress(&self, source: &Path, dest: &Path) -> Result<()>;
}

const DEFAULT_LEVEL: i32 = 3;

/// zstd codec
///
/// Each thread owns its compression and decompression contexts; the zstd
/// manual recommends reusing the context per thread.
pub struct ZstdCodec {
    com_context: ThreadLocal<RefCell<CCtx<'static>>>,
    de_context: ThreadLocal<RefCell<DCtx<'static>>>,
    level: i32,
}

impl ZstdCodec {
    pub fn new() -> Self {
        Self::with_level(DEFAULT_LEVEL)
    }

    pub fn with_level(level: i32) -> Self {
        ZstdCodec {
            com_context: ThreadLocal::new(),
            de_context: ThreadLocal::new(),
            level,
        }
    }

    fn read_range(source: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = std::fs::File::open(source)
            .or_err_with(FileOpenError, || {
                format!("fail to open {}", source.display())
            })?;
        file.seek(SeekFrom::Start(offset))
            .or_err(FileReadError, "fail to seek to segment offset")?;
        let mut raw = vec![0u8; len as usize];
        file.read_exact(&mut raw)
            .or_err_with(FileReadError, || {
                format!("fail to read {len} bytes at offset {offset}")
            })?;
        Ok(raw)
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentCodec for ZstdCodec {
    fn compress(&self, source: &Path, offset: u64, len: u64, dest: &Path) -> Result<u64> {
        let raw = Self::read_range(source, offset, len)?;
        let mut blob = Vec::with_capacity(zstd_safe::compress_bound(raw.len()));
        self.com_context
            .get_or(|| RefCell::new(CCtx::create()))
            .borrow_mut()
            .compress(&mut blob, &raw, self.level)
            .map_err(zstd_safe::get_error_name)
            .or_err(CompressError, "fail to compress segment")?;
        std::fs::write(dest, &blob).or_err_with(FileWriteError, || {
            format!("fail to write {}", dest.display())
        })?;
        Ok(blob.len() as u64)
    }

    fn decompress(&self, source: &Path, dest: &Path) -> Result<()> {
        let blob = std::fs::read(source).or_err_with(FileReadError, || {
            format!("fail to read {}", source.display())
        })?;
        // the one-shot compress above pledges the content size in the frame
        let size = zstd_safe::get_frame_content_size(&blob)
            .explain_err(DecompressError, |_| "invalid zstd frame")?
            .or_err(DecompressError, "zstd frame missing content size")?;
        let mut raw = Vec::with_capacity(size as usize);
        self.de_context
            .get_or(|| RefCell::new(DCtx::create()))
            .borrow_mut()
            .decompress(&mut raw, &blob)
            .map_err(zstd_safe::get_error_name)
            .or_err(DecompressError, "fail to decompress segment")?;
        std::fs::write(dest, &raw).or_err_with(FileWriteError, || {
            format!("fail to write {}", dest.display())
        })?;
        Ok(())
    }
}

/// Byte-for-byte "codec" so tests control stored sizes exactly
#[cfg(test)]
pub(crate) struct IdentityCodec;

#[cfg(test)]
impl SegmentCodec for IdentityCodec {
    fn compress(&self, source: &Path, offset: u64, len: u64, dest: &Path) -> Result<u64> {
        let raw = ZstdCodec::read_range(source, offset, len)?;
        std::fs::write(dest, &raw).or_err(FileWriteError, "fail to write identity blob")?;
        Ok(raw.len() as u64)
    }

    fn decompress(&self, source: &Path, dest: &Path) -> Result<()> {
        let raw = std::fs::read(source).or_err(FileReadError, "fail to read identity blob")?;
        std::fs::write(dest, raw).or_err(FileWriteError, "fail to write identity blob")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(format!("/tmp/test_stratus_codec_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_zstd_round_trip() {
        let dir = test_dir("round_trip");
        let source = dir.join("source");
        let blob = dir.join("blob");
        let out = dir.join("out");
        // compressible payload
        let data: Vec<u8> = (0..100_000).map(|i| (i / 100 % 7) as u8).collect();
        std::fs::write(&source, &data).unwrap();

        let codec = ZstdCodec::new();
        let compressed = codec
            .compress(&source, 0, data.len() as u64, &blob)
            .unwrap();
        assert!(compressed < data.len() as u64);
        assert_eq!(compressed, std::fs::metadata(&blob).unwrap().len());

        codec.decompress(&blob, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn test_zstd_respects_offset_and_len() {
        let dir = test_dir("range");
        let source = dir.join("source");
        let blob = dir.join("blob");
        let out = dir.join("out");
        std::fs::write(&source, b"aaaaaaaaaa0123456789bbbbbbbbbb").unwrap();

        let codec = ZstdCodec::new();
        codec.compress(&source, 10, 10, &blob).unwrap();
        codec.decompress(&blob, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"0123456789");
    }

    #[test]
    fn test_zstd_range_past_eof_is_an_error() {
        let dir = test_dir("eof");
        let source = dir.join("source");
        std::fs::write(&source, b"short").unwrap();

        let codec = ZstdCodec::new();
        let err = codec.compress(&source, 0, 100, &dir.join("blob")).unwrap_err();
        assert_eq!(err.etype(), &FileReadError);
    }

    #[test]
    fn test_identity_round_trip() {
        let dir = test_dir("identity");
        let source = dir.join("source");
        let blob = dir.join("blob");
        let out = dir.join("out");
        std::fs::write(&source, b"xxpayloadxx").unwrap();

        let codec = IdentityCodec;
        let stored = codec.compress(&source, 2, 7, &blob).unwrap();
        assert_eq!(stored, 7);
        codec.decompress(&blob, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"payload");
    }
}
