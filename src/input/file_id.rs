// SPDX-License-Identifier: Apache-2.0

//! Path-independent file identity.
//!
//! The device and inode pair survives renames, so it is the key for every
//! piece of per-file state. A path is only ever a way to open the file.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &std::fs::Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_metadata: &std::fs::Metadata) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file identity requires a unix platform",
        ))
    }

    /// Identity of an already open handle.
    pub fn from_file(file: &File) -> io::Result<Self> {
        Self::from_metadata(&file.metadata()?)
    }

    /// Identity of whatever `path` points at right now, following symlinks.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::from_metadata(&std::fs::metadata(path)?)
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseFileIdError(String);

impl fmt::Display for ParseFileIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid file id {:?}, expected <dev>:<ino>", self.0)
    }
}

impl std::error::Error for ParseFileIdError {}

impl FromStr for FileId {
    type Err = ParseFileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseFileIdError(s.to_string());
        let (dev, ino) = s.split_once(':').ok_or_else(err)?;
        Ok(Self {
            dev: dev.parse().map_err(|_| err())?,
            ino: ino.parse().map_err(|_| err())?,
        })
    }
}

/// Current path of an open handle. Fails once the file has been unlinked.
#[cfg(target_os = "linux")]
pub fn get_path_from_file(file: &File) -> io::Result<PathBuf> {
    use std::os::unix::io::AsRawFd;

    let path = std::fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd()))?;
    // procfs marks unlinked targets instead of failing
    if path.to_string_lossy().ends_with(" (deleted)") {
        return Err(io::Error::new(io::ErrorKind::NotFound, "file was deleted"));
    }
    Ok(path)
}

#[cfg(not(target_os = "linux"))]
pub fn get_path_from_file(_file: &File) -> io::Result<PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "path lookup from handle is only supported on linux",
    ))
}
