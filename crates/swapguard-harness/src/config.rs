//! Harness configuration, loaded from TOML. Every field has a default, so an
//! empty file (or no file) yields the stock three-run protocol.

use std::path::Path;

use serde::{Deserialize, Serialize};
use swapguard_error::{Result, SwapError};
use swapguard_store::engine::validate_collection_name;
use tracing::debug;

use crate::phases::DOMAIN_COLLECTIONS;
use crate::probe::{BackendVersion, VersionHeuristic};

/// Collection used by the probe's no-op write/read. Never created.
pub const DEFAULT_PROBE_COLLECTION: &str = "__swapguard_probe";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub sentinel: SentinelConfig,
    pub checkpoints: CheckpointConfig,
    pub probe: ProbeConfig,
}

/// Where the protocol record lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub collection: String,
    pub record_id: String,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            collection: "y".to_owned(),
            record_id: "protocol".to_owned(),
        }
    }
}

/// Collection-count checkpoints. Deployments that count the sentinel
/// collection raise both counts by one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub collections_after_phase_a: usize,
    pub collections_after_phase_b: usize,
    pub count_sentinel_collection: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            collections_after_phase_a: 2,
            collections_after_phase_b: 4,
            count_sentinel_collection: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicKind {
    NumericSuffix,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub heuristic: HeuristicKind,
    /// Suffix width for `numeric_suffix`.
    pub width: usize,
    /// Needle for `substring`.
    pub needle: Option<String>,
    /// Version implied by a `substring` match.
    pub means: BackendVersion,
    pub collection: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            heuristic: HeuristicKind::NumericSuffix,
            width: 2,
            needle: None,
            means: BackendVersion::New,
            collection: DEFAULT_PROBE_COLLECTION.to_owned(),
        }
    }
}

impl ProbeConfig {
    pub fn version_heuristic(&self) -> Result<VersionHeuristic> {
        match self.heuristic {
            HeuristicKind::NumericSuffix => {
                if self.width == 0 {
                    return Err(SwapError::config("probe.width must be at least 1"));
                }
                Ok(VersionHeuristic::NumericSuffix { width: self.width })
            }
            HeuristicKind::Substring => match self.needle.as_deref() {
                Some(needle) if !needle.is_empty() => Ok(VersionHeuristic::Substring {
                    needle: needle.to_owned(),
                    means: self.means,
                }),
                _ => Err(SwapError::config(
                    "probe.needle is required for the substring heuristic",
                )),
            },
        }
    }
}

impl HarnessConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            SwapError::config(format!("cannot read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        debug!(path = %path.display(), ?config, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| SwapError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sentinel = &self.sentinel.collection;
        validate_collection_name(sentinel)
            .map_err(|_| SwapError::config(format!("invalid sentinel collection {sentinel:?}")))?;
        if DOMAIN_COLLECTIONS.contains(&sentinel.as_str()) {
            return Err(SwapError::config(format!(
                "sentinel collection {sentinel:?} collides with a domain collection"
            )));
        }
        if self.sentinel.record_id.is_empty() {
            return Err(SwapError::config("sentinel.record_id must be non-empty"));
        }
        validate_collection_name(&self.probe.collection).map_err(|_| {
            SwapError::config(format!("invalid probe collection {:?}", self.probe.collection))
        })?;
        if self.probe.collection == *sentinel
            || DOMAIN_COLLECTIONS.contains(&self.probe.collection.as_str())
        {
            return Err(SwapError::config(
                "probe collection must not be a domain or sentinel collection",
            ));
        }
        let checkpoints = &self.checkpoints;
        if checkpoints.collections_after_phase_b < checkpoints.collections_after_phase_a {
            return Err(SwapError::config(format!(
                "collection count must not decrease: after_phase_a={} after_phase_b={}",
                checkpoints.collections_after_phase_a, checkpoints.collections_after_phase_b
            )));
        }
        self.probe.version_heuristic()?;
        Ok(())
    }
}
