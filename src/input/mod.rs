// SPDX-License-Identifier: Apache-2.0

mod file_id;
mod finder;
mod fingerprint;

pub use file_id::{FileId, ParseFileIdError, get_path_from_file};
pub use finder::FileFinder;
pub use fingerprint::{Fingerprint, read_prefix};
