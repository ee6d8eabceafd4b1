// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Regex error: {0}")]
    Regex(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Registry at {path} is unreadable: {reason}")]
    RegistryCorrupt { path: PathBuf, reason: String },

    #[error("Registry version {found} is newer than supported version {supported}")]
    RegistryVersion { found: u8, supported: u8 },

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Delivery aborted with {pending} undelivered events")]
    DeliveryAborted { pending: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
