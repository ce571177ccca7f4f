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

//! Segment key

use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

// 16-byte / 128-bit key: large enough to avoid collision
const KEY_SIZE: usize = 16;

/// An 128 bit hash binary
pub type HashBinary = [u8; KEY_SIZE];

/// Blake2b hashing to 128 bits, the content addressing function
pub type Blake2b128 = Blake2b<blake2::digest::consts::U16>;

fn hex2str(hex: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(KEY_SIZE * 2);
    for c in hex {
        write!(s, "{:02x}", c).unwrap(); // safe, just dump hex to string
    }
    s
}

/// Decode the hex str into [HashBinary].
///
/// Return `None` when the decode fails or the input is not exact 32 (to decode to 16 bytes).
pub fn str2hex(s: &str) -> Option<HashBinary> {
    if s.len() != KEY_SIZE * 2 {
        return None;
    }
    let mut output = [0; KEY_SIZE];
    // no need to bubble the error, it should be obvious why the decode fails
    hex::decode_to_slice(s.as_bytes(), &mut output).ok()?;
    Some(output)
}

/// The content hash identifying one segment.
///
/// The same value keys the segment everywhere it can live: its lowercase hex
/// rendering is both the filename in the local cache directory and the object
/// key in the remote store. Keys are supplied by the deduplication layer, not
/// derived here, except for [SegmentKey::from_content] which front-ends and
/// tests use to address raw bytes.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentKey(HashBinary);

impl SegmentKey {
    /// Wrap an existing 16-byte hash as a key
    pub fn new(bin: HashBinary) -> Self {
        SegmentKey(bin)
    }

    /// Hash `content` into its segment key
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Blake2b128::new();
        hasher.update(content);
        SegmentKey(hasher.finalize().into())
    }

    /// Parse a key from its hex rendering, e.g. a cache directory filename.
    ///
    /// `None` when the input is not exactly 32 hex chars.
    pub fn from_hex(s: &str) -> Option<Self> {
        str2hex(s).map(SegmentKey)
    }

    /// The raw hash bytes
    pub fn as_bin(&self) -> HashBinary {
        self.0
    }

    /// The key as one 128 bit integer, for keying lock tables
    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0) // endianness doesn't matter
    }
}

impl Display for SegmentKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", hex2str(&self.0))
    }
}

impl Debug for SegmentKey {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "SegmentKey({})", hex2str(&self.0))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let key = SegmentKey::from_content(b"segment bytes");
        let hex = key.to_string();
        assert_eq!(hex.len(), KEY_SIZE * 2);
        assert_eq!(SegmentKey::from_hex(&hex), Some(key));
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(SegmentKey::from_hex("deadbeef"), None); // too short
        assert_eq!(
            SegmentKey::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"),
            None
        );
    }

    #[test]
    fn test_content_addressing() {
        let a = SegmentKey::from_content(b"aaa");
        let b = SegmentKey::from_content(b"bbb");
        assert_ne!(a, b);
        // same content, same key
        assert_eq!(a, SegmentKey::from_content(b"aaa"));
    }

    #[test]
    fn test_key_ordering_is_deterministic() {
        let mut keys = vec![
            SegmentKey::from_content(b"1"),
            SegmentKey::from_content(b"2"),
            SegmentKey::from_content(b"3"),
        ];
        let mut again = keys.clone();
        keys.sort();
        again.sort();
        assert_eq!(keys, again);
    }
}
