//! Engine asset cache
//!
//! Keeps the engine runtime script and WebAssembly binary in a durable
//! bucket so the engine can cold-start without the network.

mod cache;

pub use cache::{fetch_remote_refs, AssetCache, AssetUrls};

use thiserror::Error;

/// Errors raised while fetching or caching engine assets
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("{0} is not available in this environment")]
    StorageUnavailable(&'static str),

    #[error("Failed to fetch {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to fetch {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Asset cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}
