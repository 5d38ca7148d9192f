//! Utility functions for sysfs and procfs pseudo-files

use std::fs;
use std::io;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::{Result, ZramError};

/// Read a pseudo-file, keeping the path in the error message
pub fn read_sysfs_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| with_path(path, e))
}

/// Write a pseudo-file in a single `write(2)`
pub fn write_sysfs_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| with_path(path, e))
}

/// Parse a single unsigned integer attribute such as `disksize`
pub fn parse_u64_attr(name: &str, content: &str) -> Result<u64> {
    content
        .trim()
        .parse::<u64>()
        .map_err(|e| ZramError::Parse(format!("Invalid {}: {:?} ({})", name, content.trim(), e)))
}

/// Split a whitespace-separated record and require an exact field count.
///
/// Returns `Err(actual_count)` when the layout does not match.
pub fn split_fields(content: &str, expected: usize) -> std::result::Result<Vec<&str>, usize> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() != expected {
        return Err(fields.len());
    }
    Ok(fields)
}

/// Wait with exponential backoff until `check` holds.
///
/// Returns false once every delay in `delays_ms` has been spent.
pub fn poll_backoff<F: FnMut() -> bool>(delays_ms: &[u64], mut check: F) -> bool {
    if check() {
        return true;
    }
    for delay in delays_ms {
        thread::sleep(Duration::from_millis(*delay));
        if check() {
            return true;
        }
    }
    false
}

fn with_path(path: &Path, e: io::Error) -> ZramError {
    ZramError::Io(io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))
}
