//! Small shared helpers: atomic file writes, time-range parsing.

use std::path::Path;

use chrono::Duration;

/// Writes content to a file atomically: write to .tmp, then rename.
/// Rename is atomic on the same filesystem (POSIX guarantee), so a crash
/// mid-write leaves the old content readable.
pub fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Atomic write with string content (convenience).
pub fn atomic_write_str(path: &Path, content: &str) -> std::io::Result<()> {
    atomic_write(path, content.as_bytes())
}

/// Parse a symbolic time range like `1day`, `7days`, `30days` into a
/// duration. Ranges outside 1..=365 days are rejected.
pub fn parse_time_range(range: &str) -> Option<Duration> {
    let lower = range.trim().to_lowercase();
    let digits = lower
        .strip_suffix("days")
        .or_else(|| lower.strip_suffix("day"))?;
    let n: i64 = digits.parse().ok()?;
    if (1..=365).contains(&n) {
        Some(Duration::days(n))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_basic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        atomic_write_str(&path, "hello world").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world");
    }

    #[test]
    fn test_atomic_write_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        atomic_write_str(&path, "first").unwrap();
        atomic_write_str(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_parse_time_range() {
        assert_eq!(parse_time_range("1day"), Some(Duration::days(1)));
        assert_eq!(parse_time_range("7days"), Some(Duration::days(7)));
        assert_eq!(parse_time_range(" 30days "), Some(Duration::days(30)));
        assert_eq!(parse_time_range("0days"), None);
        assert_eq!(parse_time_range("400days"), None);
        assert_eq!(parse_time_range("week"), None);
        assert_eq!(parse_time_range(""), None);
    }
}
