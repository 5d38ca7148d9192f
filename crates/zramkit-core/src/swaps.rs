//! `/proc/swaps` parsing

use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, ZramError};

/// One line of the kernel swap listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapEntry {
    pub filename: PathBuf,
    pub kind: String,
    pub size_kib: u64,
    pub used_kib: u64,
    pub priority: i32,
}

/// Parse the swap listing
///
/// Format:
/// ```text
/// Filename                                Type            Size            Used            Priority
/// /dev/zram0                              partition       4194300         0               100
/// ```
pub fn parse_swaps(content: &str) -> Result<Vec<SwapEntry>> {
    let mut entries = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() || line.starts_with("Filename") {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(ZramError::Parse(format!(
                "Expected 5 fields in swap listing, got {}: {}",
                parts.len(),
                line
            )));
        }

        let number = |field: &str| -> Result<i64> {
            field
                .parse::<i64>()
                .map_err(|e| ZramError::Parse(format!("Invalid swap field {:?}: {}", field, e)))
        };

        entries.push(SwapEntry {
            filename: PathBuf::from(unescape_octal(parts[0])),
            kind: parts[1].to_string(),
            size_kib: number(parts[2])?.max(0) as u64,
            used_kib: number(parts[3])?.max(0) as u64,
            priority: number(parts[4])? as i32,
        });
    }

    Ok(entries)
}

/// Whether `node` is currently listed as swap
pub fn is_listed(entries: &[SwapEntry], node: &Path) -> bool {
    entries.iter().any(|e| e.filename == node)
}

/// The kernel escapes whitespace in paths as `\ooo`
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(byte) = u8::try_from(value) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
/dev/nvme0n1p3                          partition\t8388604\t\t0\t\t-2\n\
/dev/zram0                              partition\t10236\t\t512\t\t100\n";

    #[test]
    fn test_parse_swaps() {
        let entries = parse_swaps(LISTING).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].filename, PathBuf::from("/dev/nvme0n1p3"));
        assert_eq!(entries[0].priority, -2);

        assert_eq!(entries[1].filename, PathBuf::from("/dev/zram0"));
        assert_eq!(entries[1].kind, "partition");
        assert_eq!(entries[1].size_kib, 10236);
        assert_eq!(entries[1].used_kib, 512);
        assert_eq!(entries[1].priority, 100);
    }

    #[test]
    fn test_parse_empty_listing() {
        let entries = parse_swaps("Filename\tType\tSize\tUsed\tPriority\n").unwrap();
        assert!(entries.is_empty());
        assert!(parse_swaps("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_swaps("/dev/zram0 partition 10\n").is_err());
        assert!(parse_swaps("/dev/zram0 partition ten 0 100\n").is_err());
    }

    #[test]
    fn test_is_listed() {
        let entries = parse_swaps(LISTING).unwrap();
        assert!(is_listed(&entries, Path::new("/dev/zram0")));
        assert!(!is_listed(&entries, Path::new("/dev/zram1")));
    }

    #[test]
    fn test_escaped_filename() {
        let content = "/swap\\040file file 1024 0 -3\n";
        let entries = parse_swaps(content).unwrap();
        assert_eq!(entries[0].filename, PathBuf::from("/swap file"));
    }
}
