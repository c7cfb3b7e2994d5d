use anyhow::{Context, Result};
use keel_broker::{BrokerOptions, TopicOptions};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // Root directory holding one subdirectory per topic.
    pub data_dir: PathBuf,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Interval between log flushes and snapshot publication.
    pub persist_interval_ms: u64,
    // Interval between cleanup passes over completed messages.
    pub cleanup_interval_ms: u64,
    // Interval between checkpoint store flushes.
    pub checkpoint_flush_interval_ms: u64,
    // Consecutive I/O failures a topic loop tolerates before stopping the topic.
    pub max_consecutive_failures: u32,
    // Size at which the message log rolls over to a new segment file.
    pub segment_size_bytes: u64,
    // Checkpoint file size that triggers compaction.
    pub checkpoint_compaction_bytes: u64,
    // Messages per in-memory buffer block.
    pub buffer_block_len: usize,
}

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    data_dir: Option<PathBuf>,
    metrics_bind: Option<String>,
    persist_interval_ms: Option<u64>,
    cleanup_interval_ms: Option<u64>,
    checkpoint_flush_interval_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    segment_size_bytes: Option<u64>,
    checkpoint_compaction_bytes: Option<u64>,
    buffer_block_len: Option<usize>,
}

fn positive_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let defaults = TopicOptions::default();
        let data_dir = std::env::var("KEEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        let metrics_bind = std::env::var("KEEL_BROKER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse KEEL_BROKER_METRICS_BIND")?;
        let persist_interval_ms = positive_env("KEEL_PERSIST_INTERVAL_MS")
            .unwrap_or(defaults.persist_interval.as_millis() as u64);
        let cleanup_interval_ms = positive_env("KEEL_CLEANUP_INTERVAL_MS")
            .unwrap_or(defaults.cleanup_interval.as_millis() as u64);
        let checkpoint_flush_interval_ms = positive_env("KEEL_CHECKPOINT_FLUSH_INTERVAL_MS")
            .unwrap_or(defaults.checkpoint_flush_interval.as_millis() as u64);
        let max_consecutive_failures = positive_env("KEEL_MAX_CONSECUTIVE_FAILURES")
            .unwrap_or(defaults.max_consecutive_failures);
        let segment_size_bytes =
            positive_env("KEEL_SEGMENT_SIZE_BYTES").unwrap_or(defaults.segment_size_bytes);
        let checkpoint_compaction_bytes = positive_env("KEEL_CHECKPOINT_COMPACTION_BYTES")
            .unwrap_or(defaults.checkpoint_compaction_bytes);
        let buffer_block_len =
            positive_env("KEEL_BUFFER_BLOCK_LEN").unwrap_or(defaults.buffer.block_len);
        Ok(Self {
            data_dir,
            metrics_bind,
            persist_interval_ms,
            cleanup_interval_ms,
            checkpoint_flush_interval_ms,
            max_consecutive_failures,
            segment_size_bytes,
            checkpoint_compaction_bytes,
            buffer_block_len,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("KEEL_BROKER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read KEEL_BROKER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.data_dir {
                config.data_dir = value;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.persist_interval_ms
                && value > 0
            {
                config.persist_interval_ms = value;
            }
            if let Some(value) = override_cfg.cleanup_interval_ms
                && value > 0
            {
                config.cleanup_interval_ms = value;
            }
            if let Some(value) = override_cfg.checkpoint_flush_interval_ms
                && value > 0
            {
                config.checkpoint_flush_interval_ms = value;
            }
            if let Some(value) = override_cfg.max_consecutive_failures
                && value > 0
            {
                config.max_consecutive_failures = value;
            }
            if let Some(value) = override_cfg.segment_size_bytes
                && value > 0
            {
                config.segment_size_bytes = value;
            }
            if let Some(value) = override_cfg.checkpoint_compaction_bytes
                && value > 0
            {
                config.checkpoint_compaction_bytes = value;
            }
            if let Some(value) = override_cfg.buffer_block_len
                && value > 0
            {
                config.buffer_block_len = value;
            }
        }
        Ok(config)
    }

    pub fn broker_options(&self) -> BrokerOptions {
        let defaults = TopicOptions::default();
        BrokerOptions {
            data_dir: self.data_dir.clone(),
            topic: TopicOptions {
                persist_interval: Duration::from_millis(self.persist_interval_ms),
                cleanup_interval: Duration::from_millis(self.cleanup_interval_ms),
                checkpoint_flush_interval: Duration::from_millis(self.checkpoint_flush_interval_ms),
                max_consecutive_failures: self.max_consecutive_failures,
                buffer: keel_broker::BufferOptions {
                    block_len: self.buffer_block_len,
                    ..defaults.buffer
                },
                segment_size_bytes: self.segment_size_bytes,
                checkpoint_compaction_bytes: self.checkpoint_compaction_bytes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    const KEYS: [&str; 10] = [
        "KEEL_DATA_DIR",
        "KEEL_BROKER_METRICS_BIND",
        "KEEL_PERSIST_INTERVAL_MS",
        "KEEL_CLEANUP_INTERVAL_MS",
        "KEEL_CHECKPOINT_FLUSH_INTERVAL_MS",
        "KEEL_MAX_CONSECUTIVE_FAILURES",
        "KEEL_SEGMENT_SIZE_BYTES",
        "KEEL_CHECKPOINT_COMPACTION_BYTES",
        "KEEL_BUFFER_BLOCK_LEN",
        "KEEL_BROKER_CONFIG",
    ];

    fn clear_env() -> Vec<EnvGuard> {
        KEYS.iter().map(|key| EnvGuard::unset(key)).collect()
    }

    #[test]
    #[serial]
    fn defaults_match_the_engine_defaults() -> Result<()> {
        let _guards = clear_env();
        let config = BrokerConfig::from_env()?;
        assert_eq!(config.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(config.metrics_bind, DEFAULT_METRICS_BIND.parse::<SocketAddr>()?);
        assert_eq!(config.broker_options().topic, TopicOptions::default());
        Ok(())
    }

    #[test]
    #[serial]
    fn env_values_override_defaults() -> Result<()> {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("KEEL_DATA_DIR", "/var/lib/keel");
        let _g2 = EnvGuard::set("KEEL_PERSIST_INTERVAL_MS", "20");
        let _g3 = EnvGuard::set("KEEL_MAX_CONSECUTIVE_FAILURES", "4");
        let _g4 = EnvGuard::set("KEEL_SEGMENT_SIZE_BYTES", "4096");
        // Zero and garbage fall back to defaults.
        let _g5 = EnvGuard::set("KEEL_CLEANUP_INTERVAL_MS", "0");
        let _g6 = EnvGuard::set("KEEL_BUFFER_BLOCK_LEN", "lots");

        let options = BrokerConfig::from_env()?.broker_options();
        assert_eq!(options.data_dir, PathBuf::from("/var/lib/keel"));
        assert_eq!(options.topic.persist_interval, Duration::from_millis(20));
        assert_eq!(options.topic.max_consecutive_failures, 4);
        assert_eq!(options.topic.segment_size_bytes, 4096);
        assert_eq!(
            options.topic.cleanup_interval,
            TopicOptions::default().cleanup_interval
        );
        assert_eq!(
            options.topic.buffer.block_len,
            TopicOptions::default().buffer.block_len
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn invalid_metrics_bind_is_an_error() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("KEEL_BROKER_METRICS_BIND", "not-an-addr");
        assert!(BrokerConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() -> Result<()> {
        let _guards = clear_env();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broker.yaml");
        fs::write(
            &path,
            "data_dir: /srv/keel\nmetrics_bind: 127.0.0.1:9100\ncheckpoint_flush_interval_ms: 250\nbuffer_block_len: 0\n",
        )?;
        let _g1 = EnvGuard::set("KEEL_CHECKPOINT_FLUSH_INTERVAL_MS", "40");
        let _g2 = EnvGuard::set("KEEL_BROKER_CONFIG", path.to_str().expect("utf-8 path"));

        let config = BrokerConfig::from_env_or_yaml()?;
        assert_eq!(config.data_dir, PathBuf::from("/srv/keel"));
        assert_eq!(config.metrics_bind, "127.0.0.1:9100".parse::<SocketAddr>()?);
        assert_eq!(config.checkpoint_flush_interval_ms, 250);
        assert_eq!(
            config.buffer_block_len,
            TopicOptions::default().buffer.block_len
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn unreadable_yaml_is_an_error() {
        let _guards = clear_env();
        let _g1 = EnvGuard::set("KEEL_BROKER_CONFIG", "/nonexistent/keel.yaml");
        assert!(BrokerConfig::from_env_or_yaml().is_err());
    }
}
