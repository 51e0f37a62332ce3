//! The scheduling reactor.
//!
//! Seeds a queue from the root's requirements, hands items to idle workers,
//! folds their replies back into the queue and the result set, and stops
//! once nothing is queued and nothing is owed.

use super::pool::{PoolEvent, PoolStats, WorkerPool};
use super::protocol::Message;
use super::signals::TerminationReason;
use super::worker_main::compile_loop;
use crate::compiler::{Autoloads, BuildContext, CompileOptions, CompiledUnit, Compiler};
use crate::config::PreforkConfig;
use crate::error::{ForkbuildError, Result};
use crate::order::correct_order;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{HashSet, VecDeque};
use std::io::IsTerminal;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// A requirement waiting to be dispatched.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// File that declared the requirement.
    pub origin: String,
    pub requirement: String,
    pub autoloads: Autoloads,
    pub options: CompileOptions,
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Units appended to the build context.
    pub compiled: usize,
    /// Worker processes forked.
    pub workers_spawned: usize,
    /// Compile requests sent.
    pub dispatched: usize,
}

/// Drives a [`WorkerPool`] until every reachable requirement is compiled.
pub struct Scheduler<'c, C: Compiler + ?Sized> {
    compiler: &'c C,
    config: PreforkConfig,
}

impl<'c, C: Compiler + ?Sized> Scheduler<'c, C> {
    pub fn new(compiler: &'c C, config: PreforkConfig) -> Self {
        Self { compiler, config }
    }

    /// Compile everything reachable from `requirements` and append the
    /// units to `ctx.processed` in sequential-equivalent order.
    ///
    /// An empty requirement list returns immediately without forking.
    pub fn process_requires(
        &self,
        ctx: &mut BuildContext,
        origin: &str,
        requirements: &[String],
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) -> Result<RunSummary> {
        if requirements.is_empty() {
            return Ok(RunSummary::default());
        }

        let (accumulated, stats) = self.run(
            &mut ctx.already_processed,
            origin,
            requirements,
            autoloads,
            options,
        )?;

        let ordered = correct_order(accumulated, requirements, |name| {
            self.compiler.expand(name)
        });
        let summary = RunSummary {
            compiled: ordered.len(),
            workers_spawned: stats.spawned,
            dispatched: stats.dispatched,
        };
        ctx.processed.extend(ordered);
        Ok(summary)
    }

    /// Run the reactor and return the units in arrival order.
    #[instrument(level = "debug", skip_all, fields(origin = origin, roots = requirements.len()))]
    pub fn run(
        &self,
        already_processed: &mut HashSet<String>,
        origin: &str,
        requirements: &[String],
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) -> Result<(Vec<CompiledUnit>, PoolStats)> {
        self.config.validate()?;

        let started = Instant::now();
        let compiler = self.compiler;
        let mut pool = WorkerPool::new(self.config.pool_options(), move |worker| {
            compile_loop(compiler, worker)
        })?;
        let progress = Progress::new(origin, self.config.progress);

        let mut reactor = Reactor::new(compiler, already_processed, progress);
        reactor.seed(origin, requirements, autoloads, options);
        let result = reactor.drive(&mut pool, self.config.shutdown_grace);

        reactor.progress.clear();
        pool.close_all();
        pool.wait_all();

        let stats = pool.stats().clone();
        match &result {
            Ok(()) => debug!(
                built = reactor.built,
                units = reactor.accumulated.len(),
                workers = stats.spawned,
                elapsed_ms = started.elapsed().as_millis(),
                "Parallel compile finished"
            ),
            Err(e) => {
                warn!(error = %e, built = reactor.built, "Parallel compile aborted");
                if let Some(trace) = e.remote().and_then(|remote| remote.trace.as_deref()) {
                    debug!(trace, "Backtrace from worker");
                }
            }
        }

        result.map(|()| (reactor.accumulated, stats))
    }
}

/// Loop state for one run.
struct Reactor<'r, C: Compiler + ?Sized> {
    compiler: &'r C,
    queue: VecDeque<WorkItem>,
    already_processed: &'r mut HashSet<String>,
    awaiting: usize,
    built: usize,
    accumulated: Vec<CompiledUnit>,
    progress: Progress,
}

impl<'r, C: Compiler + ?Sized> Reactor<'r, C> {
    fn new(
        compiler: &'r C,
        already_processed: &'r mut HashSet<String>,
        progress: Progress,
    ) -> Self {
        Self {
            compiler,
            queue: VecDeque::new(),
            already_processed,
            awaiting: 0,
            built: 0,
            accumulated: Vec::new(),
            progress,
        }
    }

    fn seed(
        &mut self,
        origin: &str,
        requirements: &[String],
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) {
        self.enqueue(origin, requirements.to_vec(), autoloads, options);
    }

    fn enqueue(
        &mut self,
        origin: &str,
        requirements: Vec<String>,
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) {
        self.queue
            .extend(requirements.into_iter().map(|requirement| WorkItem {
                origin: origin.to_string(),
                requirement,
                autoloads: autoloads.clone(),
                options: options.clone(),
            }));
    }

    fn is_done(&self) -> bool {
        self.awaiting == 0 && self.queue.is_empty()
    }

    fn drive(&mut self, pool: &mut WorkerPool<'_>, grace: Duration) -> Result<()> {
        while !self.is_done() {
            let (events, idle) = pool.poll_events(self.queue.len())?;

            for worker in idle {
                if self.queue.is_empty() {
                    break;
                }
                self.dispatch_next(pool, worker)?;
            }

            for event in events {
                self.handle_event(pool, event, grace)?;
            }

            self.progress.update(self.built, self.awaiting);
        }
        Ok(())
    }

    /// Hand the next fresh queue item to `worker`.
    ///
    /// Items whose requirement was already dispatched are dropped here; this
    /// is the only place duplicates are filtered.
    fn dispatch_next(&mut self, pool: &mut WorkerPool<'_>, worker: usize) -> Result<()> {
        while let Some(item) = self.queue.pop_front() {
            let id = self.compiler.expand(&item.requirement);
            if !self.already_processed.insert(id) {
                trace!(requirement = %item.requirement, "Already processed, dropping");
                continue;
            }
            self.awaiting += 1;
            return pool.dispatch(
                worker,
                &item.origin,
                &item.requirement,
                &item.autoloads,
                &item.options,
            );
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        pool: &mut WorkerPool<'_>,
        event: PoolEvent,
        grace: Duration,
    ) -> Result<()> {
        let PoolEvent { worker, message } = event;
        match message {
            Some(Message::NewRequires {
                origin,
                requirements,
                autoloads,
                options,
            }) => {
                self.enqueue(&origin, requirements, &autoloads, &options);
            }
            Some(Message::NewAsset { unit }) => {
                self.awaiting = self.awaiting.checked_sub(1).ok_or_else(|| {
                    ForkbuildError::Protocol(format!(
                        "worker {} answered a compile nobody asked for",
                        worker
                    ))
                })?;
                self.built += 1;
                pool.complete(worker);
                if let Some(unit) = unit {
                    self.accumulated.push(unit);
                }
            }
            Some(Message::MissingRequireError { origin, error }) => {
                return Err(ForkbuildError::MissingRequire {
                    origin,
                    cause: error,
                });
            }
            Some(Message::Fault { error }) => return Err(ForkbuildError::WorkerFault(error)),
            Some(Message::Close) => {
                pool.goodbye(worker);
                return check_not_lost(pool, worker, grace);
            }
            Some(Message::Compile { .. }) => {
                return Err(ForkbuildError::Protocol(format!(
                    "worker {} sent a compile request",
                    worker
                )));
            }
            None => return check_not_lost(pool, worker, grace),
        }
        Ok(())
    }
}

/// A worker that stopped talking while it still owed answers is lost.
fn check_not_lost(pool: &mut WorkerPool<'_>, worker: usize, grace: Duration) -> Result<()> {
    let in_flight = pool.worker(worker).in_flight();
    if in_flight == 0 {
        return Ok(());
    }
    let pid = pool.worker(worker).pid().as_raw();
    let reason = pool
        .reap(worker, grace)
        .unwrap_or(TerminationReason::Unknown);
    Err(ForkbuildError::WorkerLost {
        pid,
        in_flight,
        reason: reason.to_string(),
    })
}

/// The overwritten status line on stderr.
struct Progress {
    bar: ProgressBar,
}

impl Progress {
    fn new(origin: &str, enabled: bool) -> Self {
        let bar = if enabled && std::io::stderr().is_terminal() {
            let bar = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::with_template("{msg} [{bar:30.cyan/blue}] {percent}%")
            {
                bar.set_style(style.progress_chars("█▓▒░  "));
            }
            bar.set_message(origin.to_string());
            bar
        } else {
            ProgressBar::hidden()
        };
        Self { bar }
    }

    fn update(&self, built: usize, awaiting: usize) {
        self.bar.set_length((built + awaiting) as u64);
        self.bar.set_position(built as u64);
    }

    fn clear(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileError, RequireSink};
    use crate::prefork::fork_guard;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::PathBuf;

    /// In-memory graph compiler that journals every compile to a file, so
    /// the parent can count calls made in child processes.
    struct GraphCompiler {
        graph: HashMap<String, Vec<String>>,
        stubs: Vec<String>,
        hidden: HashMap<String, Vec<String>>,
        journal: PathBuf,
    }

    impl GraphCompiler {
        fn new(edges: &[(&str, &[&str])], journal: PathBuf) -> Self {
            let graph = edges
                .iter()
                .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
                .collect();
            Self {
                graph,
                stubs: Vec::new(),
                hidden: HashMap::new(),
                journal,
            }
        }

        fn compiled(&self) -> Vec<(String, i32)> {
            std::fs::read_to_string(&self.journal)
                .unwrap_or_default()
                .lines()
                .filter_map(|line| {
                    let (pid, name) = line.split_once(' ')?;
                    Some((name.to_string(), pid.parse().ok()?))
                })
                .collect()
        }
    }

    impl Compiler for GraphCompiler {
        fn expand(&self, name: &str) -> String {
            name.trim_end_matches(".js").to_string()
        }

        fn compile(
            &self,
            requirement: &str,
            autoloads: &Autoloads,
            options: &CompileOptions,
            sink: &mut dyn RequireSink,
        ) -> std::result::Result<Option<CompiledUnit>, CompileError> {
            let id = self.expand(requirement);
            let mut journal = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.journal)
                .map_err(|e| CompileError::Failed(e.to_string()))?;
            writeln!(journal, "{} {}", std::process::id(), id)
                .map_err(|e| CompileError::Failed(e.to_string()))?;

            if id == "explode" {
                return Err(CompileError::Failed("explode: unexpected token".into()));
            }
            if self.stubs.contains(&id) {
                return Ok(None);
            }
            if let Some(extra) = self.hidden.get(&id) {
                sink.require(&id, extra.clone(), autoloads, options)
                    .map_err(|e| CompileError::Failed(e.to_string()))?;
            }
            match self.graph.get(&id) {
                Some(deps) => Ok(Some(CompiledUnit::new(
                    id.clone(),
                    deps.clone(),
                    format!("/* {} */", id),
                ))),
                None => Err(CompileError::MissingRequire {
                    requirement: requirement.to_string(),
                    message: "not in graph".into(),
                }),
            }
        }
    }

    fn config(workers: usize) -> PreforkConfig {
        PreforkConfig::new()
            .with_workers(workers)
            .with_progress(false)
            .with_seed(42)
    }

    fn reqs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn build(
        compiler: &GraphCompiler,
        workers: usize,
        roots: &[&str],
    ) -> (Result<RunSummary>, BuildContext) {
        let mut ctx = BuildContext::new();
        let result = Scheduler::new(compiler, config(workers)).process_requires(
            &mut ctx,
            "root.js",
            &reqs(roots),
            &Autoloads::new(),
            &CompileOptions::new(),
        );
        (result, ctx)
    }

    fn order(ctx: &BuildContext) -> Vec<&str> {
        ctx.processed.iter().map(|u| u.filename.as_str()).collect()
    }

    fn assert_reaped(pids: impl IntoIterator<Item = i32>) {
        for pid in pids {
            // A zombie still accepts signal 0; a reaped pid does not exist.
            assert!(
                kill(Pid::from_raw(pid), None).is_err(),
                "worker {} was not reaped",
                pid
            );
        }
    }

    #[test]
    fn test_restores_sequential_order() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let compiler = GraphCompiler::new(
            &[("A", &["C"]), ("B", &[]), ("C", &[])],
            dir.path().join("journal"),
        );

        let (result, ctx) = build(&compiler, 4, &["A", "B"]);
        let summary = result.unwrap();
        assert_eq!(order(&ctx), vec!["C", "A", "B"]);
        assert_eq!(summary.compiled, 3);
        assert_eq!(summary.dispatched, 3);
        assert!(summary.workers_spawned >= 1 && summary.workers_spawned <= 4);
        assert_eq!(ctx.concatenated(), "/* C */\n/* A */\n/* B */\n");
    }

    #[test]
    fn test_diamond_compiles_shared_dependency_once() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let compiler = GraphCompiler::new(
            &[
                ("top", &["left", "right"]),
                ("left", &["X"]),
                ("right", &["X.js"]),
                ("X", &[]),
            ],
            dir.path().join("journal"),
        );

        let (result, ctx) = build(&compiler, 3, &["top"]);
        result.unwrap();
        assert_eq!(order(&ctx), vec!["X", "left", "right", "top"]);

        let compiled = compiler.compiled();
        let x_count = compiled.iter().filter(|(name, _)| name == "X").count();
        assert_eq!(x_count, 1);
        assert_eq!(compiled.len(), 4);
        assert!(ctx.already_processed.contains("X"));
    }

    #[test]
    fn test_empty_requirements_spawn_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = GraphCompiler::new(&[], dir.path().join("journal"));
        let (result, ctx) = build(&compiler, 4, &[]);
        assert_eq!(result.unwrap(), RunSummary::default());
        assert!(ctx.processed.is_empty());
        assert!(compiler.compiled().is_empty());
    }

    #[test]
    fn test_already_processed_requirements_are_skipped() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let compiler = GraphCompiler::new(&[("A", &["B"]), ("B", &[])], dir.path().join("journal"));

        let mut ctx = BuildContext::new();
        ctx.already_processed.insert("B".to_string());
        let summary = Scheduler::new(&compiler, config(2))
            .process_requires(
                &mut ctx,
                "root.js",
                &reqs(&["A"]),
                &Autoloads::new(),
                &CompileOptions::new(),
            )
            .unwrap();
        assert_eq!(order(&ctx), vec!["A"]);
        assert_eq!(summary.dispatched, 1);
    }

    #[test]
    fn test_stubbed_requirement_produces_no_unit() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let mut compiler =
            GraphCompiler::new(&[("A", &["stub"]), ("stub", &[])], dir.path().join("journal"));
        compiler.stubs.push("stub".into());

        let (result, ctx) = build(&compiler, 2, &["A"]);
        result.unwrap();
        assert_eq!(order(&ctx), vec!["A"]);
        assert!(ctx.already_processed.contains("stub"));
    }

    #[test]
    fn test_nested_discovery_reaches_top_level_queue() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let mut compiler = GraphCompiler::new(
            &[("A", &[]), ("helper", &[])],
            dir.path().join("journal"),
        );
        compiler.hidden.insert("A".into(), vec!["helper".into()]);

        let (result, ctx) = build(&compiler, 2, &["A"]);
        result.unwrap();
        // Not a declared dependency, so it sorts after the ordered units.
        assert_eq!(order(&ctx), vec!["A", "helper"]);
    }

    #[test]
    fn test_missing_require_fails_and_reaps_workers() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let compiler = GraphCompiler::new(
            &[("A", &["B", "ghost"]), ("B", &[])],
            dir.path().join("journal"),
        );

        let (result, ctx) = build(&compiler, 3, &["A"]);
        match result {
            Err(ForkbuildError::MissingRequire { origin, cause }) => {
                assert_eq!(origin, "A");
                assert!(cause.message.contains("ghost"));
            }
            other => panic!("Expected MissingRequire, got {:?}", other),
        }
        assert!(ctx.processed.is_empty());
        assert_reaped(compiler.compiled().into_iter().map(|(_, pid)| pid));
    }

    #[test]
    fn test_worker_fault_propagates_verbatim() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let compiler = GraphCompiler::new(&[("A", &["explode"])], dir.path().join("journal"));

        let (result, _) = build(&compiler, 2, &["A"]);
        match result {
            Err(ForkbuildError::WorkerFault(error)) => {
                assert_eq!(error.message, "explode: unexpected token");
            }
            other => panic!("Expected WorkerFault, got {:?}", other),
        }
        assert_reaped(compiler.compiled().into_iter().map(|(_, pid)| pid));
    }

    #[test]
    fn test_single_worker_builds_wide_graph() {
        let _guard = fork_guard();
        let dir = tempfile::tempdir().unwrap();
        let leaves: Vec<String> = (0..20).map(|i| format!("leaf{}", i)).collect();
        let leaf_refs: Vec<&str> = leaves.iter().map(String::as_str).collect();
        let mut edges: Vec<(&str, &[&str])> = Vec::new();
        edges.push(("hub", leaf_refs.as_slice()));
        for leaf in &leaf_refs {
            edges.push((*leaf, &[]));
        }
        let compiler = GraphCompiler::new(&edges, dir.path().join("journal"));

        let (result, ctx) = build(&compiler, 1, &["hub"]);
        let summary = result.unwrap();
        assert_eq!(summary.workers_spawned, 1);
        let mut expected = leaf_refs.clone();
        expected.push("hub");
        assert_eq!(order(&ctx), expected);
    }
}
