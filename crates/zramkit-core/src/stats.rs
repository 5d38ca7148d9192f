//! Per-device counters from `/sys/block/zramN/{stat,mm_stat}`

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, ZramError};
use crate::kernel::{Attr, ZramKernel};
use crate::sysfs::split_fields;

/// Field count of the block layer `stat` record
pub const IO_STAT_FIELDS: usize = 11;

/// Field count of the zram `mm_stat` record
pub const MM_STAT_FIELDS: usize = 7;

/// Counters of one device at one refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Completed read I/Os since device creation
    pub num_reads: u64,

    /// Completed write I/Os since device creation
    pub num_writes: u64,

    /// Uncompressed size of data currently stored (bytes)
    pub orig_data_size: u64,

    /// Compressed size of data currently stored (bytes)
    pub compr_data_size: u64,
}

impl StatsSnapshot {
    /// Compression ratio (orig / compr), 0.0 when nothing is stored
    pub fn compression_ratio(&self) -> f64 {
        if self.compr_data_size == 0 {
            return 0.0;
        }
        self.orig_data_size as f64 / self.compr_data_size as f64
    }

    /// Memory saved by compression in percent
    pub fn space_savings(&self) -> f64 {
        if self.orig_data_size == 0 {
            return 0.0;
        }
        (1.0 - self.compr_data_size as f64 / self.orig_data_size as f64) * 100.0
    }

    /// True if the I/O counters went backwards relative to `previous`
    pub fn counters_regressed(&self, previous: &StatsSnapshot) -> bool {
        self.num_reads < previous.num_reads || self.num_writes < previous.num_writes
    }
}

/// Parse the 11-field block `stat` record into (reads, writes)
///
/// Format (Documentation/block/stat.rst):
/// ```text
/// read_ios read_merges read_sectors read_ticks write_ios write_merges
/// write_sectors write_ticks in_flight io_ticks time_in_queue
/// ```
pub fn parse_io_stat(index: u32, content: &str) -> Result<(u64, u64)> {
    let fields = split_fields(content, IO_STAT_FIELDS).map_err(|n| {
        ZramError::stats(
            index,
            format!(
                "unexpected field count in stat: expected {}, got {}",
                IO_STAT_FIELDS, n
            ),
        )
    })?;

    Ok((
        parse_counter(index, "stat", fields[0])?,
        parse_counter(index, "stat", fields[4])?,
    ))
}

/// Parse the 7-field `mm_stat` record into (orig_data_size, compr_data_size)
///
/// Format (Documentation/admin-guide/blockdev/zram.rst):
/// ```text
/// orig_data_size compr_data_size mem_used_total mem_limit
/// mem_used_max same_pages pages_compacted
/// ```
pub fn parse_mm_stat(index: u32, content: &str) -> Result<(u64, u64)> {
    let fields = split_fields(content, MM_STAT_FIELDS).map_err(|n| {
        ZramError::stats(
            index,
            format!(
                "unexpected field count in mm_stat: expected {}, got {}",
                MM_STAT_FIELDS, n
            ),
        )
    })?;

    Ok((
        parse_counter(index, "mm_stat", fields[0])?,
        parse_counter(index, "mm_stat", fields[1])?,
    ))
}

fn parse_counter(index: u32, record: &str, field: &str) -> Result<u64> {
    field.parse::<u64>().map_err(|_| {
        ZramError::stats(index, format!("non-numeric field {:?} in {}", field, record))
    })
}

/// Reads counters without touching device state
pub struct StatsReader {
    kernel: Arc<dyn ZramKernel>,
}

impl StatsReader {
    pub fn new(kernel: Arc<dyn ZramKernel>) -> Self {
        Self { kernel }
    }

    pub fn refresh(&self, index: u32) -> Result<StatsSnapshot> {
        let stat = self.kernel.read_attr(index, Attr::Stat)?;
        let mm_stat = self.kernel.read_attr(index, Attr::MmStat)?;

        let (num_reads, num_writes) = parse_io_stat(index, &stat)?;
        let (orig_data_size, compr_data_size) = parse_mm_stat(index, &mm_stat)?;

        Ok(StatsSnapshot {
            num_reads,
            num_writes,
            orig_data_size,
            compr_data_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "     312        0     2496        4     1024        0     8192       12        0       20       16\n";
    const MM_STAT: &str = " 4194304   1048576  1310720        0  1310720        3        0\n";

    #[test]
    fn test_parse_io_stat() {
        let (reads, writes) = parse_io_stat(0, STAT).unwrap();
        assert_eq!(reads, 312);
        assert_eq!(writes, 1024);
    }

    #[test]
    fn test_parse_mm_stat() {
        let (orig, compr) = parse_mm_stat(0, MM_STAT).unwrap();
        assert_eq!(orig, 4194304);
        assert_eq!(compr, 1048576);
    }

    #[test]
    fn test_io_stat_rejects_newer_layout() {
        // 17 fields: discard and flush columns added in later kernels
        let content = "1 0 8 0 2 0 16 0 0 0 0 0 0 0 0 0 0";
        let err = parse_io_stat(2, content).unwrap_err();
        match err {
            ZramError::Stats { index, reason } => {
                assert_eq!(index, 2);
                assert!(reason.contains("unexpected field count"));
                assert!(reason.contains("got 17"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_mm_stat_rejects_short_record() {
        let err = parse_mm_stat(1, "0 0 0").unwrap_err();
        assert!(err.to_string().contains("unexpected field count"));
    }

    #[test]
    fn test_non_numeric_field() {
        let err = parse_mm_stat(1, "x 0 0 0 0 0 0").unwrap_err();
        assert!(matches!(err, ZramError::Stats { .. }));
    }

    #[test]
    fn test_derived_ratios() {
        let snapshot = StatsSnapshot {
            orig_data_size: 4096,
            compr_data_size: 1024,
            ..Default::default()
        };
        assert_eq!(snapshot.compression_ratio(), 4.0);
        assert_eq!(snapshot.space_savings(), 75.0);

        let empty = StatsSnapshot::default();
        assert_eq!(empty.compression_ratio(), 0.0);
        assert_eq!(empty.space_savings(), 0.0);
    }

    #[test]
    fn test_counters_regressed() {
        let before = StatsSnapshot {
            num_reads: 10,
            num_writes: 10,
            ..Default::default()
        };
        let after = StatsSnapshot {
            num_reads: 12,
            num_writes: 10,
            orig_data_size: 0,
            ..Default::default()
        };
        assert!(!after.counters_regressed(&before));
        assert!(before.counters_regressed(&after));
    }
}
