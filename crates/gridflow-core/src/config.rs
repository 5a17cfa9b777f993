//! Exchange-Layer Configuration
//!
//! This module defines the knobs consumed by the buffer pool, the
//! bounded-blocking spill path, and the credit protocol:
//!
//! - **page_size**: size of one memory page handed out by the pool
//! - **buffers_per_pool**: quota of pages one result partition may hold
//! - **initial_credit**: credits granted to a view reader at registration
//! - **region_size**: spill-file region size before the region is sealed
//! - **compression**: per-buffer codec applied on the spill path
//! - **spill_dir**: directory bounded-blocking partitions write into
//!
//! ## Usage
//!
//! ```ignore
//! use gridflow_core::config::NetworkConfig;
//!
//! // Low-latency streaming setup with small pages
//! let config = NetworkConfig {
//!     page_size: 4 * 1024,
//!     buffers_per_pool: 8,
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::compression::Compression;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Size in bytes of one memory page (default: 32 KiB)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Number of pages one result partition's local pool may hold (default: 32)
    #[serde(default = "default_buffers_per_pool")]
    pub buffers_per_pool: usize,

    /// Credits granted to a newly registered view reader (default: 8)
    #[serde(default = "default_initial_credit")]
    pub initial_credit: u32,

    /// Bytes written to a spill region before it is sealed (default: 4 MiB)
    #[serde(default = "default_region_size")]
    pub region_size: usize,

    /// Compression codec for spilled data buffers
    #[serde(default)]
    pub compression: Compression,

    /// Directory bounded-blocking partitions spill into
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            buffers_per_pool: default_buffers_per_pool(),
            initial_credit: default_initial_credit(),
            region_size: default_region_size(),
            compression: Compression::default(),
            spill_dir: default_spill_dir(),
        }
    }
}

fn default_page_size() -> usize {
    32 * 1024
}

fn default_buffers_per_pool() -> usize {
    32
}

fn default_initial_credit() -> u32 {
    8
}

fn default_region_size() -> usize {
    4 * 1024 * 1024
}

fn default_spill_dir() -> PathBuf {
    PathBuf::from("./data/exchange")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.page_size, 32 * 1024);
        assert_eq!(config.buffers_per_pool, 32);
        assert_eq!(config.initial_credit, 8);
        assert_eq!(config.compression, Compression::None);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"page_size": 1024}"#).unwrap();
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.buffers_per_pool, 32);
    }
}
