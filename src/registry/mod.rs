// SPDX-License-Identifier: Apache-2.0

//! Durable per-file read progress.
//!
//! Only the publisher writes to the registry, and only after the sink has
//! acknowledged the batch a position came from.

mod schema;
mod store;

pub use schema::{FileState, REGISTRY_VERSION, RegistryDocument};
pub use store::{Registry, RegistryOptions};
