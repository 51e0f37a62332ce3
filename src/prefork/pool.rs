//! Worker pool with a single multiplexed readiness wait.
//!
//! The pool starts with one worker and forks more lazily, only while there
//! is queued work to hand out, so short builds never pay for a full pool.

use super::proc::{Entrypoint, Worker};
use super::protocol::Message;
use super::signals::TerminationReason;
use crate::compiler::{Autoloads, CompileOptions};
use crate::error::{ForkbuildError, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

/// Default odds of growing the pool on one poll: one in six.
pub const DEFAULT_GROWTH_ODDS: u32 = 6;

/// Tuning knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on the number of workers.
    pub target_size: usize,
    /// The pool grows with probability `1 / growth_odds` per poll.
    pub growth_odds: u32,
    /// Longest a poll blocks without any activity.
    pub poll_interval: Duration,
    /// How long a closed worker gets to exit before it is signalled.
    pub shutdown_grace: Duration,
    /// Seed for the growth roll; random when `None`.
    pub seed: Option<u64>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            target_size: 1,
            growth_odds: DEFAULT_GROWTH_ODDS,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(2),
            seed: None,
        }
    }
}

/// Something a worker said, or the fact that it hung up.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolEvent {
    /// Index of the worker in the pool.
    pub worker: usize,
    /// `None` when the worker's channel reached EOF or broke.
    pub message: Option<Message>,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers forked over the pool's lifetime.
    pub spawned: usize,
    /// Compile requests sent.
    pub dispatched: usize,
    /// Compile requests answered.
    pub completed: usize,
}

#[derive(Clone, Copy)]
enum Interest {
    Read,
    Write,
}

/// A lazily growing set of worker processes.
pub struct WorkerPool<'a> {
    workers: Vec<Worker>,
    entrypoint: Box<Entrypoint<'a>>,
    options: PoolOptions,
    rng: StdRng,
    stats: PoolStats,
}

impl<'a> WorkerPool<'a> {
    /// Create a pool and fork its first worker.
    pub fn new<F>(options: PoolOptions, entrypoint: F) -> Result<Self>
    where
        F: Fn(&mut Worker) -> Result<()> + 'a,
    {
        if options.target_size == 0 {
            return Err(ForkbuildError::Config(
                "worker pool target size must be at least 1".into(),
            ));
        }
        if options.growth_odds == 0 {
            return Err(ForkbuildError::Config("growth odds must be at least 1".into()));
        }

        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::rng().random()),
        };

        debug!(target_size = options.target_size, "Initializing worker pool");

        let mut pool = Self {
            workers: Vec::with_capacity(options.target_size),
            entrypoint: Box::new(entrypoint),
            options,
            rng,
            stats: PoolStats::default(),
        };
        pool.grow()?;
        Ok(pool)
    }

    /// Fork one more worker.
    fn grow(&mut self) -> Result<()> {
        let inherited: Vec<_> = self
            .workers
            .iter()
            .flat_map(Worker::orchestrator_fds)
            .collect();
        let worker = Worker::spawn(self.workers.len(), &inherited, &*self.entrypoint)?;
        self.workers.push(worker);
        self.stats.spawned += 1;
        trace!(size = self.workers.len(), target = self.options.target_size, "Pool grew");
        Ok(())
    }

    /// Number of live worker slots.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn target_size(&self) -> usize {
        self.options.target_size
    }

    pub fn worker(&self, index: usize) -> &Worker {
        &self.workers[index]
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Block until a worker has something to say, or until idle workers
    /// can take some of the `pending` queued items.
    ///
    /// Write interest is registered on at most `pending` idle workers, so
    /// capacity on offer never exceeds the backlog. Returns the events read
    /// and the idle workers ready to accept a compile.
    #[instrument(level = "trace", skip(self))]
    pub fn poll_events(&mut self, pending: usize) -> Result<(Vec<PoolEvent>, Vec<usize>)> {
        let buffered: Vec<bool> = self.workers.iter().map(Worker::has_buffered_input).collect();
        let offered: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.is_idle())
            .map(|(i, _)| i)
            .take(pending)
            .collect();

        let (readable, writable) = {
            let mut fds = Vec::with_capacity(self.workers.len() + offered.len());
            let mut slots = Vec::with_capacity(fds.capacity());
            for (i, worker) in self.workers.iter().enumerate() {
                if let Some(fd) = worker.read_fd() {
                    fds.push(PollFd::new(fd, PollFlags::POLLIN));
                    slots.push((i, Interest::Read));
                }
            }
            for &i in &offered {
                if let Some(fd) = self.workers[i].write_fd() {
                    fds.push(PollFd::new(fd, PollFlags::POLLOUT));
                    slots.push((i, Interest::Write));
                }
            }
            if fds.is_empty() {
                return Err(ForkbuildError::Protocol(
                    "every worker channel is closed".into(),
                ));
            }

            // A frame already sitting in a read buffer won't wake poll.
            let timeout_ms: u16 = if buffered.iter().any(|&b| b) {
                0
            } else {
                self.options.poll_interval.as_millis().min(u16::MAX as u128) as u16
            };

            loop {
                match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                    Ok(_) => break,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let mut readable = Vec::new();
            let mut writable = Vec::new();
            for (pfd, &(i, interest)) in fds.iter().zip(&slots) {
                let revents = pfd.revents().unwrap_or(PollFlags::empty());
                match interest {
                    Interest::Read => {
                        let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                        if buffered[i] || revents.intersects(ready) {
                            readable.push(i);
                        }
                    }
                    Interest::Write => {
                        if revents.contains(PollFlags::POLLOUT) {
                            writable.push(i);
                        }
                    }
                }
            }
            (readable, writable)
        };

        let mut events = Vec::with_capacity(readable.len());
        for i in readable {
            let worker = &mut self.workers[i];
            let message = match worker.receive() {
                Ok(message) => message,
                Err(ForkbuildError::Io(e)) => {
                    warn!(
                        worker_id = i,
                        pid = worker.pid().as_raw(),
                        error = %e,
                        "Worker channel broke"
                    );
                    None
                }
                Err(e) => return Err(e),
            };
            if message.is_none() {
                worker.goodbye();
            }
            events.push(PoolEvent { worker: i, message });
        }

        if self.workers.len() < self.options.target_size
            && pending > 0
            && self.rng.random_ratio(1, self.options.growth_odds)
        {
            self.grow()?;
        }

        Ok((events, writable))
    }

    /// Send a compile request to an idle worker.
    pub fn dispatch(
        &mut self,
        index: usize,
        origin: &str,
        requirement: &str,
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) -> Result<()> {
        let worker = &mut self.workers[index];
        worker.send(&Message::compile(
            origin,
            requirement,
            autoloads.clone(),
            options.clone(),
        ))?;
        worker.begin_job();
        self.stats.dispatched += 1;
        trace!(worker_id = index, requirement, "Dispatched compile");
        Ok(())
    }

    /// Record that a worker answered a compile.
    pub fn complete(&mut self, index: usize) {
        self.workers[index].finish_job();
        self.stats.completed += 1;
    }

    /// Stop listening to one worker.
    pub fn goodbye(&mut self, index: usize) {
        self.workers[index].goodbye();
    }

    /// Close one worker and collect its exit status.
    pub fn reap(&mut self, index: usize, grace: Duration) -> Result<TerminationReason> {
        let worker = &mut self.workers[index];
        worker.close();
        worker.reap(grace)
    }

    /// Close every worker's channels.
    pub fn close_all(&mut self) {
        for worker in &mut self.workers {
            worker.close();
        }
    }

    /// Reap every worker, signalling any that outlive the grace period.
    pub fn wait_all(&mut self) {
        let grace = self.options.shutdown_grace;
        for worker in &mut self.workers {
            match worker.reap(grace) {
                Ok(reason) if reason.is_success() => {}
                Ok(reason) => {
                    debug!(
                        worker_id = worker.id(),
                        pid = worker.pid().as_raw(),
                        reason = %reason,
                        "Worker exited abnormally"
                    )
                }
                Err(e) => warn!(worker_id = worker.id(), error = %e, "Failed to reap worker"),
            }
        }
    }
}

impl Drop for WorkerPool<'_> {
    fn drop(&mut self) {
        self.close_all();
        self.wait_all();
    }
}
