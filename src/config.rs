//! Gateway configuration. Option parsing and a CLI front end are out of
//! scope; this module only defines the struct and its `toml`-backed load
//! path, with a file-then-defaults precedence and no CLI layer.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{GatewayError, GwResult};
use crate::types::{GatewayId, VolumeId};

/// Static, per-process gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub gateway_id: GatewayId,
    pub volume_id: VolumeId,
    /// Root of the on-disk block cache (`<data_root>/files/...`).
    pub data_root: PathBuf,
    pub block_size: u64,
    pub max_read_freshness_ms: u64,
    pub max_write_freshness_ms: u64,
    pub max_read_retry: u32,
    pub retry_delay_ms: u64,
    pub cache_soft_limit: usize,
    pub cache_hard_limit: usize,
    /// Bound on in-flight parallel downloads per read/write-pipeline call
    /// (`min(ms.max_connections, request_count)`).
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: GatewayId(0),
            volume_id: VolumeId(0),
            data_root: PathBuf::from("./ug-data"),
            block_size: 4096,
            max_read_freshness_ms: 5_000,
            max_write_freshness_ms: 1_000,
            max_read_retry: 3,
            retry_delay_ms: 100,
            cache_soft_limit: 1024,
            cache_hard_limit: 2048,
            max_connections: 8,
        }
    }
}

impl GatewayConfig {
    /// Loads a config from a TOML file, falling back to [`Default`] for any
    /// field the file omits. A gateway has no interactive precedence chain
    /// to thread through, unlike a CLI-overlay config.
    ///
    /// # Errors
    /// Returns [`GatewayError::Io`] if the file cannot be read, or
    /// [`GatewayError::Config`] if it cannot be parsed.
    pub fn load(path: &Path) -> GwResult<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))
    }

    /// Loads from `path` if it exists, otherwise returns the default
    /// configuration unchanged.
    #[must_use]
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                log::warn!("failed to parse gateway config at {}: {e}, using defaults", path.display());
                Self::default()
            })
        } else {
            Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let cfg = GatewayConfig { gateway_id: GatewayId(7), volume_id: VolumeId(3), ..Default::default() };
        let text = toml::to_string(&cfg).unwrap();
        let back: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.gateway_id, cfg.gateway_id);
        assert_eq!(back.block_size, 4096);
    }

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let cfg = GatewayConfig::load_or_default(Path::new("/nonexistent/gateway.toml"));
        assert_eq!(cfg.block_size, 4096);
    }
}
