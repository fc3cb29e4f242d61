use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for one analysis run. Every field has a default, so a config
/// file only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Worker threads for the decode and rule stages (0 = one per core).
    pub workers: usize,
    /// Idle time after which a non-TCP flow is considered finished.
    pub flow_idle_timeout_secs: i64,
    /// Upper bound on a decoded (dechunked / decompressed) body.
    pub max_body_bytes: usize,
    /// Entropy in bits/byte at or above which a payload counts as encrypted.
    pub encryption_entropy_threshold: f64,
    /// Payloads shorter than this are never classified by entropy.
    pub min_entropy_sample: usize,
    /// Longest excerpt kept on a match.
    pub max_excerpt_chars: usize,
    /// Compiled size limit for rule patterns.
    pub regex_size_limit: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            flow_idle_timeout_secs: 120,
            max_body_bytes: 16 * 1024 * 1024,
            encryption_entropy_threshold: 7.5,
            min_entropy_sample: 64,
            max_excerpt_chars: 256,
            regex_size_limit: 1024 * 1024,
        }
    }
}

impl AnalysisConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flow_idle_timeout_secs <= 0 {
            anyhow::bail!("flow_idle_timeout_secs must be positive");
        }
        if !(0.0..=8.0).contains(&self.encryption_entropy_threshold) {
            anyhow::bail!("encryption_entropy_threshold must be within 0.0..=8.0");
        }
        if self.max_excerpt_chars == 0 {
            anyhow::bail!("max_excerpt_chars must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: AnalysisConfig = serde_json::from_str(r#"{"workers": 4}"#).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.flow_idle_timeout_secs, 120);
        assert_eq!(config.max_excerpt_chars, 256);
    }

    #[test]
    fn test_from_file_rejects_bad_threshold() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"encryption_entropy_threshold": 9.5}}"#).unwrap();
        assert!(AnalysisConfig::from_file(file.path()).is_err());
    }
}
