// SPDX-License-Identifier: (MIT OR Apache-2.0)

use std::time::Duration;

use serde::Deserialize;

/// Hub tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Bytes requested per non-blocking read on a descriptor.
    pub read_chunk: usize,
    /// Max readiness events taken from the reactor per wait.
    pub max_events: usize,
    /// Delay `stop()` sleeps before signalling shutdown.
    pub stop_grace_ms: u64,
    /// Pause between write attempts when a descriptor would block.
    pub write_backoff_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            read_chunk: 4096,
            max_events: 64,
            stop_grace_ms: 1,
            write_backoff_ms: 1,
        }
    }
}

impl HubConfig {
    /// Load from environment variables, keeping the default for any that are
    /// unset or unparsable: VANILLA_READ_CHUNK, VANILLA_MAX_EVENTS,
    /// VANILLA_STOP_GRACE_MS, VANILLA_WRITE_BACKOFF_MS.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            read_chunk: env_or("VANILLA_READ_CHUNK", defaults.read_chunk),
            max_events: env_or("VANILLA_MAX_EVENTS", defaults.max_events),
            stop_grace_ms: env_or("VANILLA_STOP_GRACE_MS", defaults.stop_grace_ms),
            write_backoff_ms: env_or("VANILLA_WRITE_BACKOFF_MS", defaults.write_backoff_ms),
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn write_backoff(&self) -> Duration {
        Duration::from_millis(self.write_backoff_ms)
    }

    /// Zero-sized reads and event buffers make no sense; clamp to one.
    pub(crate) fn sanitized(mut self) -> Self {
        self.read_chunk = self.read_chunk.max(1);
        self.max_events = self.max_events.max(1);
        self
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: HubConfig = serde_json::from_str(r#"{ "read_chunk": 512 }"#).unwrap();
        assert_eq!(cfg.read_chunk, 512);
        assert_eq!(cfg.max_events, 64);
        assert_eq!(cfg.stop_grace(), Duration::from_millis(1));
    }

    #[test]
    fn sanitized_clamps_zeroes() {
        let cfg = HubConfig {
            read_chunk: 0,
            max_events: 0,
            ..HubConfig::default()
        }
        .sanitized();
        assert_eq!(cfg.read_chunk, 1);
        assert_eq!(cfg.max_events, 1);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("VANILLA_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("VANILLA_TEST_GARBAGE", 9usize), 9);
        std::env::set_var("VANILLA_TEST_GARBAGE", " 17 ");
        assert_eq!(env_or("VANILLA_TEST_GARBAGE", 9usize), 17);
        std::env::remove_var("VANILLA_TEST_GARBAGE");
    }

    #[test]
    fn from_env_reads_overrides_and_keeps_defaults() {
        std::env::set_var("VANILLA_READ_CHUNK", "512");
        std::env::set_var("VANILLA_MAX_EVENTS", "lots");
        std::env::set_var("VANILLA_STOP_GRACE_MS", "25");
        std::env::remove_var("VANILLA_WRITE_BACKOFF_MS");

        let cfg = HubConfig::from_env();
        for key in ["VANILLA_READ_CHUNK", "VANILLA_MAX_EVENTS", "VANILLA_STOP_GRACE_MS"] {
            std::env::remove_var(key);
        }

        assert_eq!(cfg.read_chunk, 512);
        assert_eq!(cfg.max_events, 64);
        assert_eq!(cfg.stop_grace(), Duration::from_millis(25));
        assert_eq!(cfg.write_backoff(), Duration::from_millis(1));
    }
}
