// SPDX-License-Identifier: Apache-2.0

use tracing::trace;

use super::{Sink, SinkError};
use crate::event::Batch;

/// Acknowledges everything and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl Sink for DiscardSink {
    fn name(&self) -> &'static str {
        "discard"
    }

    async fn send(&mut self, batch: &Batch) -> Result<(), SinkError> {
        trace!(seq = batch.seq, events = batch.events.len(), "Discarding batch");
        Ok(())
    }
}
