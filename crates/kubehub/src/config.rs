//! Per-watcher tuning knobs and their `LAZYWATCH_*` environment overrides.

use std::time::Duration;

/// How often the engine re-delivers every cached object to catch missed changes.
/// Resyncs cost a fair amount on large clusters, so keep this coarse.
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(120);

/// Quiet time after the last change before waiters are woken.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(50);

/// Capacity of the change-signal channel between delta processing and the debouncer.
pub const DEFAULT_EVENT_BUFFER: usize = 10;

/// Per-watcher tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Zero disables resync.
    pub resync_period: Duration,
    pub quiet_period: Duration,
    pub event_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_period: DEFAULT_RESYNC_PERIOD,
            quiet_period: DEFAULT_QUIET_PERIOD,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl WatchConfig {
    /// Read overrides from `LAZYWATCH_RESYNC_SECS`, `LAZYWATCH_QUIET_MS` and
    /// `LAZYWATCH_EVENT_BUFFER`. Unparsable values keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |k: &str| lookup(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            resync_period: num("LAZYWATCH_RESYNC_SECS").map(Duration::from_secs).unwrap_or(d.resync_period),
            quiet_period: num("LAZYWATCH_QUIET_MS").filter(|ms| *ms > 0).map(Duration::from_millis).unwrap_or(d.quiet_period),
            event_buffer: num("LAZYWATCH_EVENT_BUFFER").filter(|n| *n > 0).map(|n| n as usize).unwrap_or(d.event_buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> WatchConfig {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        WatchConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(cfg(&[]), WatchConfig::default());
        assert_eq!(WatchConfig::default().quiet_period, Duration::from_millis(50));
        assert_eq!(WatchConfig::default().event_buffer, 10);
    }

    #[test]
    fn overrides_and_fallbacks() {
        let c = cfg(&[("LAZYWATCH_RESYNC_SECS", "0"), ("LAZYWATCH_QUIET_MS", "200"), ("LAZYWATCH_EVENT_BUFFER", "nope")]);
        assert_eq!(c.resync_period, Duration::ZERO);
        assert_eq!(c.quiet_period, Duration::from_millis(200));
        assert_eq!(c.event_buffer, DEFAULT_EVENT_BUFFER);

        let c = cfg(&[("LAZYWATCH_QUIET_MS", "0"), ("LAZYWATCH_EVENT_BUFFER", "0")]);
        assert_eq!(c.quiet_period, DEFAULT_QUIET_PERIOD);
        assert_eq!(c.event_buffer, DEFAULT_EVENT_BUFFER);
    }
}
