//! Process resource probes used for worker recycling.

const PAGE_SIZE: u64 = 4096;

/// Resident set size of this process in bytes, if it can be read.
pub fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            return parse_statm_rss(&statm);
        }
    }
    None
}

/// Resident set size in whole megabytes.
pub fn resident_memory_mb() -> Option<u64> {
    resident_memory_bytes().map(|b| b / (1024 * 1024))
}

fn parse_statm_rss(statm: &str) -> Option<u64> {
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|rss| rss.parse::<u64>().ok())
        .map(|pages| pages * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rss_pages() {
        assert_eq!(parse_statm_rss("5000 256 100 1 0 300 0\n"), Some(256 * 4096));
        assert_eq!(parse_statm_rss("5000"), None);
        assert_eq!(parse_statm_rss(""), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_own_memory() {
        assert!(resident_memory_bytes().unwrap_or(0) > 0);
    }
}
