use serde::{Deserialize, Serialize};

/// Tuning knobs for the renter's download engine.
///
/// The embedding layer constructs this (or deserializes it from its own
/// config file) and hands it to `Renter::new`. Defaults are moderate:
/// latency targeting and overdrive are hedges, not guarantees, and the
/// values here mirror what works for a typical host set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenterConfig {
    /// Total byte budget for in-flight piece buffers and decode slots.
    pub memory_budget: u64,
    /// Default per-download latency target in milliseconds. Workers whose
    /// recent latency exceeds a chunk's target are held on standby.
    pub default_latency_target_ms: u64,
    /// Milliseconds added to the latency target for each successive chunk of
    /// a download, so slower workers become acceptable on trailing chunks.
    pub latency_relax_per_chunk_ms: u64,
    /// Default number of extra pieces to fetch beyond the minimum, hedging
    /// against slow hosts.
    pub default_overdrive: u32,
    /// Overdrive only applies to the first N chunks of a download; later
    /// chunks fetch exactly the minimum.
    pub overdrive_chunk_cutoff: u64,
    /// Default download priority. Higher priorities are scheduled first.
    pub default_priority: u64,
    /// A piece fetch is abandoned after `fetch_timeout_factor` times the
    /// chunk's latency target.
    pub fetch_timeout_factor: u32,
    /// Floor for the per-fetch deadline, in milliseconds.
    pub min_fetch_timeout_ms: u64,
    /// How far ahead of the next expected offset a streaming destination will
    /// buffer out-of-order chunk writes, in bytes.
    pub stream_window: u64,
}

impl Default for RenterConfig {
    fn default() -> Self {
        Self {
            memory_budget: 256 * 1024 * 1024,
            default_latency_target_ms: 25_000,
            latency_relax_per_chunk_ms: 25,
            default_overdrive: 2,
            overdrive_chunk_cutoff: 2,
            default_priority: 5,
            fetch_timeout_factor: 4,
            min_fetch_timeout_ms: 2_000,
            stream_window: 16 * 1024 * 1024,
        }
    }
}

impl RenterConfig {
    /// Parse a config from TOML. Missing fields are an error; callers that
    /// want partial overrides should start from `Default` and patch fields.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Serialize to pretty TOML, e.g. for writing a template config file.
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = RenterConfig::default();
        assert_eq!(cfg.memory_budget, 256 * 1024 * 1024);
        assert_eq!(cfg.default_latency_target_ms, 25_000);
        assert_eq!(cfg.latency_relax_per_chunk_ms, 25);
        assert_eq!(cfg.default_overdrive, 2);
        assert_eq!(cfg.overdrive_chunk_cutoff, 2);
        assert_eq!(cfg.default_priority, 5);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = RenterConfig::default();
        let toml = cfg.to_toml_string().unwrap();
        let parsed = RenterConfig::from_toml_str(&toml).unwrap();
        assert_eq!(parsed.memory_budget, cfg.memory_budget);
        assert_eq!(parsed.default_overdrive, cfg.default_overdrive);
        assert_eq!(parsed.stream_window, cfg.stream_window);
    }

    #[test]
    fn config_toml_custom_values() {
        let toml = r#"
            memory_budget = 1048576
            default_latency_target_ms = 100
            latency_relax_per_chunk_ms = 10
            default_overdrive = 1
            overdrive_chunk_cutoff = 4
            default_priority = 9
            fetch_timeout_factor = 2
            min_fetch_timeout_ms = 500
            stream_window = 65536
        "#;
        let cfg = RenterConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.memory_budget, 1048576);
        assert_eq!(cfg.default_overdrive, 1);
        assert_eq!(cfg.overdrive_chunk_cutoff, 4);
        assert_eq!(cfg.min_fetch_timeout_ms, 500);
    }
}
