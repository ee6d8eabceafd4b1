// SPDX-License-Identifier: Apache-2.0

//! Content fingerprint used to catch inode reuse.
//!
//! A deleted log's inode can be handed to a brand new file. The registry
//! keeps a digest of the first bytes it saw for each identity; if the file
//! now carrying that identity no longer starts with those bytes, it is a
//! different file and must not inherit the old offset.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Number of leading bytes covered by the digest
    len: u64,
    blake3: String,
}

impl Fingerprint {
    pub fn from_bytes(prefix: &[u8]) -> Self {
        Self {
            len: prefix.len() as u64,
            blake3: blake3::hash(prefix).to_hex().to_string(),
        }
    }

    /// Fingerprint the first `size` bytes of `file`, or fewer if it is shorter.
    /// Leaves the cursor at the start of the file.
    pub fn read(file: &mut File, size: usize) -> io::Result<Self> {
        let prefix = read_prefix(file, size)?;
        Ok(Self::from_bytes(&prefix))
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `prefix` (the leading bytes of a file) is consistent with this
    /// fingerprint. An empty fingerprint proves nothing and always matches.
    pub fn matches(&self, prefix: &[u8]) -> bool {
        if self.len == 0 {
            return true;
        }
        let len = self.len as usize;
        if prefix.len() < len {
            return false;
        }
        blake3::hash(&prefix[..len]).to_hex().as_str() == self.blake3
    }

    /// Whether this fingerprint covers fewer bytes than `size` and the file
    /// now has more to offer.
    pub fn can_grow(&self, size: usize, file_len: u64) -> bool {
        (self.len as usize) < size && file_len > self.len
    }
}

pub fn read_prefix(file: &mut File, size: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::with_capacity(size);
    file.by_ref().take(size as u64).read_to_end(&mut buf)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_limits_to_size() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Perforce server info:\n\t2024/01/02 10:00:00 pid 1\n")
            .unwrap();

        let mut f = file.reopen().unwrap();
        let fp = Fingerprint::read(&mut f, 8).unwrap();
        assert_eq!(fp.len(), 8);
        assert_eq!(fp, Fingerprint::from_bytes(b"Perforce"));
    }

    #[test]
    fn test_short_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let mut f = file.reopen().unwrap();
        let fp = Fingerprint::read(&mut f, 1024).unwrap();
        assert_eq!(fp.len(), 3);
        assert!(fp.can_grow(1024, 10));
        assert!(!fp.can_grow(1024, 3));
        assert!(!fp.can_grow(3, 10));
    }

    #[test]
    fn test_matches_grown_file() {
        let fp = Fingerprint::from_bytes(b"hello");
        assert!(fp.matches(b"hello"));
        assert!(fp.matches(b"hello world"));
        assert!(!fp.matches(b"hell"));
        assert!(!fp.matches(b"jello world"));
    }

    #[test]
    fn test_empty_matches_anything() {
        let fp = Fingerprint::from_bytes(b"");
        assert!(fp.is_empty());
        assert!(fp.matches(b""));
        assert!(fp.matches(b"anything"));
    }

    #[test]
    fn test_serde_shape() {
        let fp = Fingerprint::from_bytes(b"abc");
        let value = serde_json::to_value(&fp).unwrap();
        assert_eq!(value["len"], 3);
        assert_eq!(value["blake3"].as_str().unwrap().len(), 64);

        let back: Fingerprint = serde_json::from_value(value).unwrap();
        assert_eq!(back, fp);
    }
}
