//! Scheduler configuration.
//!
//! # Environment Variables
//!
//! - `FORKBUILD_WORKERS` - Maximum number of worker processes
//! - `FORKBUILD_NO_PROGRESS` - Any non-empty value other than `0` hides the
//!   progress line

use crate::error::{ForkbuildError, Result};
use crate::prefork::{DEFAULT_GROWTH_ODDS, PoolOptions};
use std::time::Duration;

/// Configuration for one parallel build.
#[derive(Debug, Clone)]
pub struct PreforkConfig {
    /// Explicit worker count; derived from available parallelism when `None`.
    pub workers: Option<usize>,
    /// Show a progress line when stderr is a terminal.
    pub progress: bool,
    /// Longest the scheduler sleeps without activity.
    pub poll_interval: Duration,
    /// How long a closed worker gets before it is signalled.
    pub shutdown_grace: Duration,
    /// The pool grows with probability `1 / growth_odds` per poll.
    pub growth_odds: u32,
    /// Seed for pool growth decisions (random when `None`).
    pub seed: Option<u64>,
}

impl Default for PreforkConfig {
    fn default() -> Self {
        Self {
            workers: None,
            progress: true,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(2),
            growth_odds: DEFAULT_GROWTH_ODDS,
            seed: None,
        }
    }
}

impl PreforkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an explicit worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Enable or disable the progress line.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Seed pool growth decisions.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the pool growth odds.
    pub fn with_growth_odds(mut self, odds: u32) -> Self {
        self.growth_odds = odds;
        self
    }

    /// Apply `FORKBUILD_*` environment overrides.
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup("FORKBUILD_WORKERS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
        {
            self.workers = Some(workers);
        }

        if let Some(flag) = lookup("FORKBUILD_NO_PROGRESS") {
            let flag = flag.trim();
            if !flag.is_empty() && flag != "0" {
                self.progress = false;
            }
        }

        self
    }

    /// Number of workers the pool may grow to.
    ///
    /// Without an explicit count, three quarters of the available
    /// parallelism, rounded up.
    pub fn target_size(&self) -> usize {
        match self.workers {
            Some(n) => n.max(1),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                default_target_size(cpus)
            }
        }
    }

    /// Reject values the pool cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == Some(0) {
            return Err(ForkbuildError::Config("worker count must be at least 1".into()));
        }
        if self.growth_odds == 0 {
            return Err(ForkbuildError::Config("growth odds must be at least 1".into()));
        }
        Ok(())
    }

    /// Pool options derived from this configuration.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            target_size: self.target_size(),
            growth_odds: self.growth_odds,
            poll_interval: self.poll_interval,
            shutdown_grace: self.shutdown_grace,
            seed: self.seed,
        }
    }
}

fn default_target_size(cpus: usize) -> usize {
    (cpus * 3).div_ceil(4).max(1)
}
