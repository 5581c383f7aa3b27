//! Resident set size from `/proc/self/status`.

use crate::error::{HeapwatchError, Result};

const STATUS_PATH: &str = "/proc/self/status";

/// Reads the resident set size of the current process, in bytes.
///
/// # Errors
///
/// Returns [`HeapwatchError::MetricsRead`] if the status file is missing (non-Linux platforms) or has no
/// parsable `VmRSS` line.
pub fn resident_set_bytes() -> Result<u64> {
    let content = std::fs::read_to_string(STATUS_PATH)
        .map_err(|e| HeapwatchError::MetricsRead(format!("failed to read {STATUS_PATH}: {e}")))?;
    parse_resident_set(&content)
}

/// Extracts `VmRSS` from the content of a status file.
/// Format: "`VmRSS`:    12345 kB"
fn parse_resident_set(content: &str) -> Result<u64> {
    let line = content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .ok_or_else(|| HeapwatchError::MetricsRead("VmRSS not found".to_string()))?;

    let kib = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| HeapwatchError::MetricsRead(format!("missing value in line: {line}")))?
        .parse::<u64>()
        .map_err(|e| {
            HeapwatchError::MetricsRead(format!("failed to parse value in '{line}': {e}"))
        })?;

    Ok(kib.saturating_mul(1024))
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_parse_vm_rss() {
        let content = "Name:\ttest\nVmPeak:\t   3072 kB\nVmRSS:\t   1024 kB\nRssAnon:\t   512 kB\n";
        let rss = parse_resident_set(content).expect("VmRSS present");
        assert_eq!(rss, 1024 * 1024);
    }

    #[test]
    fn test_should_fail_without_vm_rss() {
        let content = "Name:\ttest\nVmSize:\t   2048 kB\n";
        assert!(matches!(
            parse_resident_set(content),
            Err(HeapwatchError::MetricsRead(_))
        ));
    }

    #[test]
    fn test_should_fail_on_garbage_value() {
        let content = "VmRSS:\t   lots kB\n";
        assert!(matches!(
            parse_resident_set(content),
            Err(HeapwatchError::MetricsRead(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_should_read_own_resident_set() {
        let rss = resident_set_bytes().expect("procfs available on linux");
        assert!(rss > 0);
    }
}
