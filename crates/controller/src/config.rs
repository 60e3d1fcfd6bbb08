use std::time::Duration;

/// Runtime knobs, read from `LOOM_*` environment variables at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub workers: usize,
    /// Ready backlog above which a warning is logged; keys are never dropped.
    pub queue_cap: usize,
    pub reconcile_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Periodic re-enqueue of every known object; off when unset.
    pub resync: Option<Duration>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_cap: 4096,
            reconcile_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(300),
            resync: None,
        }
    }
}

fn env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env::<usize>("LOOM_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            queue_cap: env::<usize>("LOOM_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(d.queue_cap),
            reconcile_timeout: env::<u64>("LOOM_RECONCILE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.reconcile_timeout),
            backoff_base: env::<u64>("LOOM_BACKOFF_BASE_MS").map(Duration::from_millis).unwrap_or(d.backoff_base),
            backoff_max: env::<u64>("LOOM_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.backoff_max),
            resync: env::<u64>("LOOM_RESYNC_SECS").filter(|s| *s > 0).map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ControllerConfig::default();
        assert!(c.workers >= 2);
        assert_eq!(c.reconcile_timeout, Duration::from_secs(30));
        assert_eq!(c.backoff_base, Duration::from_millis(50));
        assert_eq!(c.backoff_max, Duration::from_secs(300));
        assert_eq!(c.resync, None);
    }
}
