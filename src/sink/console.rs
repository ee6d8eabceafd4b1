// SPDX-License-Identifier: Apache-2.0

use tokio::io::{AsyncWriteExt, Stdout, stdout};

use super::{Sink, SinkError, encode_batch};
use crate::event::Batch;

/// Writes events to stdout. Logs go to stdout too unless redirected, so this
/// is mainly for trying out a configuration.
pub struct ConsoleSink {
    out: Stdout,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self { out: stdout() }
    }
}

impl Default for ConsoleSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&mut self, batch: &Batch) -> Result<(), SinkError> {
        let buf = encode_batch(batch)?;
        self.out.write_all(&buf).await?;
        self.out.flush().await?;
        Ok(())
    }
}
