// SPDX-License-Identifier: Apache-2.0

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use std::path::Path;

use crate::error::{Error, Result};
use crate::init::args::BeatArgs;

pub const ENV_PREFIX: &str = "P4DBEAT_";

/// Read beat settings from a YAML file, with `P4DBEAT_*` environment
/// variables taking precedence. Keys missing from both keep their defaults.
pub fn load_file(path: &Path) -> Result<BeatArgs> {
    if !path.is_file() {
        return Err(Error::Config(format!(
            "config file {} does not exist",
            path.display()
        )));
    }

    Figment::new()
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX))
        .extract()
        .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
}
