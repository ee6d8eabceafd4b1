// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Sink, SinkError, encode_batch};
use crate::error::{Error, Result};
use crate::event::Batch;

/// Appends events as NDJSON to a local file. A batch counts as delivered
/// once its bytes are synced to disk.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::Sink(format!("cannot create directory {:?}: {}", parent, e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::Sink(format!("cannot open {:?}: {}", path, e)))?;

        debug!(path = ?path, "Opened file sink");
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn send(&mut self, batch: &Batch) -> std::result::Result<(), SinkError> {
        if batch.events.is_empty() {
            return Ok(());
        }
        let buf = encode_batch(batch)?;
        self.file.write_all(&buf).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}
