use crate::models::record::Envelope;
use std::fs;
use std::path::Path;

/// Load the last `n` records from a spool file, oldest first.
/// Missing files and lines that fail to parse are skipped.
pub fn load_recent(path: &Path, n: usize) -> Vec<Envelope> {
    match fs::read_to_string(path) {
        Ok(text) => parse_recent(&text, n),
        Err(_)   => Vec::new(),
    }
}

/// Parse JSONL spool text, keeping the last `n` well-formed records.
pub fn parse_recent(text: &str, n: usize) -> Vec<Envelope> {
    let mut entries: Vec<Envelope> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    if entries.len() > n {
        let drain = entries.len() - n;
        entries.drain(..drain);
    }
    entries
}
