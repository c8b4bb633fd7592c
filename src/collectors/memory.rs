use super::{CollectError, Result};

/// Extract `MemTotal:` from /proc/meminfo, converted from kB to bytes.
pub fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("MemTotal:"), Some(kb)) => Some(super::parse(kb) * 1024),
            _ => None,
        }
    })
}

/// Total physical memory in bytes.
#[cfg(target_os = "linux")]
pub fn total_memory() -> Result<u64> {
    const PATH: &str = "/proc/meminfo";
    let text = std::fs::read_to_string(PATH)
        .map_err(|source| CollectError::Io { path: PATH, source })?;
    parse_meminfo(&text).ok_or(CollectError::Parse(PATH))
}

/// Total physical memory in bytes.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn total_memory() -> Result<u64> {
    // SAFETY: sysconf has no preconditions; it returns -1 on failure.
    let (pages, page_size) = unsafe {
        (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE))
    };
    if pages <= 0 || page_size <= 0 {
        return Err(CollectError::Parse("sysconf"));
    }
    Ok(pages as u64 * page_size as u64)
}

#[cfg(not(unix))]
pub fn total_memory() -> Result<u64> {
    Err(CollectError::Unsupported("memory"))
}
