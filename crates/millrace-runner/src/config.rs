use std::time::Duration;

use millrace_domain::DomainError;

/// Identifies one runner among `count` cooperating peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSet {
    pub count: u32,
    pub id: u32,
}

impl Default for WorkerSet {
    fn default() -> Self {
        WorkerSet { count: 1, id: 0 }
    }
}

/// Per-runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Lock namespace shared by peer workers; a random uuid when absent.
    pub id: Option<String>,
    /// Failure count after which `failed_temporarily` escalates to
    /// `failed_permanently`.
    pub max_retries: u32,
    /// Budget for a single processor invocation.
    pub process_timeout: Duration,
    /// Max entries handled per `run()` pass.
    pub batch_size: usize,
    /// Minimum age in `failed_temporarily` before maintenance re-queues;
    /// `process_timeout × 10` when unset.
    pub retry_delay: Option<Duration>,
    /// A `processing` entry older than `process_timeout × stuck_multiplier`
    /// is considered stuck.
    pub stuck_multiplier: u32,
    pub workers: WorkerSet,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            id: None,
            max_retries: 5,
            process_timeout: Duration::from_secs(5 * 60),
            batch_size: 100,
            retry_delay: None,
            stuck_multiplier: 10,
            workers: WorkerSet::default(),
        }
    }
}

impl RunnerConfig {
    pub fn effective_retry_delay(&self) -> Duration {
        self.retry_delay.unwrap_or(self.process_timeout * 10)
    }

    pub fn stuck_after(&self) -> Duration {
        self.process_timeout * self.stuck_multiplier
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.workers.id >= self.workers.count {
            return Err(DomainError::InvalidWorker {
                id: self.workers.id,
                count: self.workers.count,
            });
        }
        Ok(())
    }
}

/// Options for one `run()` invocation. The timeout is advisory: it is
/// consulted between entries, never mid-entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
}

impl RunOptions {
    pub fn timeout(timeout: Duration) -> Self {
        RunOptions {
            timeout: Some(timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.process_timeout, Duration::from_secs(300));
        assert_eq!(config.effective_retry_delay(), Duration::from_secs(3000));
        assert_eq!(config.stuck_after(), Duration::from_secs(3000));
        assert_eq!(config.workers, WorkerSet { count: 1, id: 0 });
        config.validate().unwrap();
    }

    #[test]
    fn worker_id_must_be_in_range() {
        let config = RunnerConfig {
            workers: WorkerSet { count: 2, id: 2 },
            ..RunnerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
