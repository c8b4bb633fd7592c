pub mod cpu;
pub mod memory;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to read {path}: {source}")]
    Io {
        path:   &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {0}")]
    Parse(&'static str),

    #[error("{0} sampling is not supported on this platform")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, CollectError>;

fn parse(s: &str) -> u64 {
    s.parse().unwrap_or(0)
}
