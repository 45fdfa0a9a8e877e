//! The scheduler state file.
//!
//! The host writes a single word (`enabled`, `disabled`, ...) followed by a
//! newline; the loader reads it back after attaching.

use std::fs;
use std::path::Path;

use crate::HalError;

/// Trimmed contents of the state file.
pub fn read_state(path: &Path) -> Result<String, HalError> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}
