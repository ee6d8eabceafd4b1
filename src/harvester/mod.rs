// SPDX-License-Identifier: Apache-2.0

//! Per-file readers.
//!
//! A harvester owns one file identity from the moment the prospector starts
//! it until the file is retired or the beat shuts down. It survives renames
//! (it keeps its open handle), detects truncation, and never emits an event
//! for a line that is not yet complete.

mod reader;
mod task;

pub use reader::LineSplitter;
pub use task::{
    ExitReason, Harvester, HarvesterConfig, HarvesterExit, HarvesterState, Placement, Seed,
};
