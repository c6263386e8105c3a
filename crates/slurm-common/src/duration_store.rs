//! Deferred requeue table keyed by object identity.
//!
//! Sub-steps of a reconcile push the delay after which they want the object
//! looked at again. When several steps ask for different delays, the largest
//! one wins. The reconciler pops its key when it finishes, so nothing carries
//! over into the next reconcile.

use std::time::Duration;

use dashmap::DashMap;

/// Per-reconciler table of requested requeue delays
#[derive(Debug, Default)]
pub struct DurationStore {
    inner: DashMap<String, Duration>,
}

impl DurationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a requeue request, keeping the larger of the stored and new delay
    pub fn push(&self, key: impl Into<String>, duration: Duration) {
        self.inner
            .entry(key.into())
            .and_modify(|stored| {
                if duration > *stored {
                    *stored = duration;
                }
            })
            .or_insert(duration);
    }

    /// Read and clear the delay for `key`; zero when nothing was requested
    pub fn pop(&self, key: &str) -> Duration {
        self.inner
            .remove(key)
            .map(|(_, duration)| duration)
            .unwrap_or_default()
    }

    /// Read the delay for `key` without clearing it
    pub fn peek(&self, key: &str) -> Duration {
        self.inner
            .get(key)
            .map(|duration| *duration)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn larger_delay_wins() {
        let store = DurationStore::new();
        store.push("slurm/compute", Duration::from_secs(10));
        store.push("slurm/compute", Duration::from_secs(30));
        store.push("slurm/compute", Duration::from_secs(5));

        assert_eq!(store.peek("slurm/compute"), Duration::from_secs(30));
    }

    #[test]
    fn pop_clears_the_key() {
        let store = DurationStore::new();
        store.push("slurm/compute", Duration::from_secs(10));

        assert_eq!(store.pop("slurm/compute"), Duration::from_secs(10));
        assert_eq!(store.pop("slurm/compute"), Duration::ZERO);
        assert_eq!(store.peek("slurm/compute"), Duration::ZERO);
    }

    #[test]
    fn keys_are_independent() {
        let store = DurationStore::new();
        store.push("slurm/a", Duration::from_secs(1));
        store.push("slurm/b", Duration::from_secs(2));

        assert_eq!(store.pop("slurm/a"), Duration::from_secs(1));
        assert_eq!(store.peek("slurm/b"), Duration::from_secs(2));
    }

    #[test]
    fn stores_do_not_share_state() {
        let first = DurationStore::new();
        let second = DurationStore::new();
        first.push("slurm/a", Duration::from_secs(1));

        assert_eq!(second.peek("slurm/a"), Duration::ZERO);
    }
}
