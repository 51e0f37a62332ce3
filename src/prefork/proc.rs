//! Worker process handle.
//!
//! A [`Worker`] is one forked process plus two unidirectional pipes. The same
//! type is used on both ends: the orchestrator holds one per child, and the
//! child holds one describing its link back to the orchestrator.

use super::ipc::{self, FrameReader, FrameWriter};
use super::protocol::Message;
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{ForkbuildError, RemoteError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid};
use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Code run inside a freshly forked worker.
pub type Entrypoint<'a> = dyn Fn(&mut Worker) -> Result<()> + 'a;

/// Which end of the channel pair this handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Orchestrator,
    Worker,
}

/// One worker process and its channels.
pub struct Worker {
    /// Pool slot, for logging.
    id: usize,
    /// Child pid on the orchestrator side, own pid on the worker side.
    pid: Pid,
    role: Role,
    reader: Option<FrameReader>,
    writer: Option<FrameWriter>,
    /// A write hit EPIPE or a read hit EOF.
    peer_gone: bool,
    /// Compiles dispatched but not yet answered.
    in_flight: usize,
    /// Exit status once reaped.
    reaped: Option<TerminationReason>,
}

impl Worker {
    /// Fork a worker process running `entrypoint`.
    ///
    /// `inherited` lists orchestrator-side descriptors of sibling workers;
    /// the child closes them so siblings see EOF when the orchestrator goes
    /// away.
    pub fn spawn(id: usize, inherited: &[RawFd], entrypoint: &Entrypoint<'_>) -> Result<Self> {
        let (to_child_read, to_child_write) = ipc::pipe()?;
        let (to_parent_read, to_parent_write) = ipc::pipe()?;

        // Safety: the orchestrator is single threaded while it forks, and
        // the child never returns into the caller's stack.
        match unsafe { fork() }? {
            ForkResult::Child => {
                drop(to_child_write);
                drop(to_parent_read);
                for &fd in inherited {
                    // Safety: these descriptors belong to the parent's
                    // handles, whose destructors never run in this process.
                    drop(unsafe { OwnedFd::from_raw_fd(fd) });
                }

                // Writes to a vanished orchestrator must surface as EPIPE.
                unsafe {
                    signal::signal(Signal::SIGPIPE, signal::SigHandler::SigIgn).ok();
                }

                let mut worker = Self {
                    id,
                    pid: getpid(),
                    role: Role::Worker,
                    reader: Some(FrameReader::new(to_child_read)),
                    writer: Some(FrameWriter::new(to_parent_write)),
                    peer_gone: false,
                    in_flight: 0,
                    reaped: None,
                };
                let code = worker.run_guarded(entrypoint);
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                drop(to_child_read);
                drop(to_parent_write);
                debug!(worker_id = id, pid = child.as_raw(), "Spawned worker");
                Ok(Self {
                    id,
                    pid: child,
                    role: Role::Orchestrator,
                    reader: Some(FrameReader::new(to_parent_read)),
                    writer: Some(FrameWriter::new(to_child_write)),
                    peer_gone: false,
                    in_flight: 0,
                    reaped: None,
                })
            }
        }
    }

    /// Run the entrypoint, turning any escaping failure into a `Fault`.
    ///
    /// Always ends with a `Close` and a closed write channel.
    fn run_guarded(&mut self, entrypoint: &Entrypoint<'_>) -> i32 {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| entrypoint(&mut *self)));
        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(RemoteError::from_error(&e).with_captured_trace()),
            Err(payload) => Some(RemoteError::from_panic(payload.as_ref())),
        };

        let code = if let Some(error) = fault {
            let _ = self.send(&Message::Fault { error });
            1
        } else {
            0
        };
        let _ = self.send(&Message::Close);
        self.writer = None;
        code
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the other end has gone away.
    pub fn peer_gone(&self) -> bool {
        self.peer_gone
    }

    /// Send a message on this side's write channel.
    ///
    /// A broken pipe is swallowed: the peer is gone and the caller is
    /// expected to check [`Worker::peer_gone`] to wind down.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            trace!(
                worker_id = self.id,
                kind = message.kind(),
                "Dropping send on closed channel"
            );
            return Ok(());
        };

        let bytes = message.to_bytes()?;
        match writer.write_frame(&bytes) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                trace!(worker_id = self.id, kind = message.kind(), "Peer gone");
                self.peer_gone = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the next message arrives.
    ///
    /// Returns `None` once the peer closed its write channel.
    pub fn receive(&mut self) -> Result<Option<Message>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        match reader.read_frame()? {
            Some(bytes) => Ok(Some(Message::from_bytes(bytes)?)),
            None => {
                self.peer_gone = true;
                Ok(None)
            }
        }
    }

    /// Stop listening: close only the read side.
    pub fn goodbye(&mut self) {
        self.reader = None;
    }

    /// Close both directions. The orchestrator side first tells the worker
    /// no more work is coming.
    pub fn close(&mut self) {
        if self.role == Role::Orchestrator && self.writer.is_some() && !self.peer_gone {
            let _ = self.send(&Message::Close);
        }
        self.reader = None;
        self.writer = None;
    }

    /// Non-blocking reap of the process exit status.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.reaped {
            return Ok(reason.clone());
        }
        if self.role == Role::Worker {
            return Ok(TerminationReason::StillAlive);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(TerminationReason::StillAlive),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                trace!(
                    worker_id = self.id,
                    pid = self.pid.as_raw(),
                    reason = %reason,
                    "Reaped worker"
                );
                self.reaped = Some(reason.clone());
                Ok(reason)
            }
            Err(nix::errno::Errno::ECHILD) => {
                self.reaped = Some(TerminationReason::Unknown);
                Ok(TerminationReason::Unknown)
            }
            Err(e) => Err(ForkbuildError::Errno(e)),
        }
    }

    /// Reap the process, escalating to SIGTERM and then SIGKILL if it has
    /// not exited within `grace`.
    pub fn reap(&mut self, grace: Duration) -> Result<TerminationReason> {
        let start = Instant::now();
        loop {
            let reason = self.wait()?;
            if reason.is_terminal() {
                return Ok(reason);
            }
            if start.elapsed() >= grace {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        debug!(
            worker_id = self.id,
            pid = self.pid.as_raw(),
            "Worker ignored close, terminating"
        );
        let _ = signal::kill(self.pid, Signal::SIGTERM);
        std::thread::sleep(Duration::from_millis(100));
        let reason = self.wait()?;
        if reason.is_terminal() {
            return Ok(reason);
        }

        let _ = signal::kill(self.pid, Signal::SIGKILL);
        let status = waitpid(self.pid, None)?;
        let reason = analyze_wait_status(status);
        self.reaped = Some(reason.clone());
        Ok(reason)
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.is_some()
    }

    pub fn read_fd(&self) -> Option<BorrowedFd<'_>> {
        self.reader.as_ref().map(FrameReader::fd)
    }

    pub fn write_fd(&self) -> Option<BorrowedFd<'_>> {
        self.writer.as_ref().map(FrameWriter::fd)
    }

    /// Whether a full frame may already be sitting in the read buffer.
    pub fn has_buffered_input(&self) -> bool {
        self.reader.as_ref().is_some_and(FrameReader::has_buffered)
    }

    /// Raw descriptors a later-forked sibling must close.
    pub fn orchestrator_fds(&self) -> Vec<RawFd> {
        let mut fds = Vec::with_capacity(2);
        if let Some(fd) = self.read_fd() {
            fds.push(fd.as_raw_fd());
        }
        if let Some(fd) = self.write_fd() {
            fds.push(fd.as_raw_fd());
        }
        fds
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Idle means both channels open and not compiling anything.
    pub fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.reader.is_some() && self.writer.is_some() && !self.peer_gone
    }

    pub(crate) fn begin_job(&mut self) {
        self.in_flight += 1;
    }

    pub(crate) fn finish_job(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.role == Role::Orchestrator && self.reaped.is_none() {
            self.close();
            let _ = self.reap(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompiledUnit;
    use crate::prefork::fork_guard;

    fn echo(worker: &mut Worker) -> Result<()> {
        while let Some(message) = worker.receive()? {
            match message {
                Message::Compile { requirement, .. } => {
                    let unit = CompiledUnit::new(requirement, vec![], "echo");
                    worker.send(&Message::NewAsset { unit: Some(unit) })?;
                }
                Message::Close => {
                    worker.goodbye();
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    #[test]
    fn test_spawn_send_receive_close() {
        let _guard = fork_guard();
        let mut worker = Worker::spawn(0, &[], &echo).unwrap();
        assert_eq!(worker.role(), Role::Orchestrator);

        worker
            .send(&Message::compile("root", "a", Default::default(), Default::default()))
            .unwrap();
        match worker.receive().unwrap() {
            Some(Message::NewAsset { unit: Some(unit) }) => assert_eq!(unit.filename, "a"),
            other => panic!("Expected NewAsset, got {:?}", other),
        }

        worker.send(&Message::Close).unwrap();
        // The guard always answers with Close before exiting.
        assert_eq!(worker.receive().unwrap(), Some(Message::Close));
        assert_eq!(worker.receive().unwrap(), None);
        assert!(worker.peer_gone());

        worker.close();
        let reason = worker.reap(Duration::from_secs(5)).unwrap();
        assert!(reason.is_success(), "worker {}", reason);
    }

    #[test]
    fn test_error_becomes_fault() {
        let _guard = fork_guard();
        let failing = |_: &mut Worker| -> Result<()> {
            Err(ForkbuildError::Protocol("entrypoint gave up".into()))
        };
        let mut worker = Worker::spawn(0, &[], &failing).unwrap();

        match worker.receive().unwrap() {
            Some(Message::Fault { error }) => assert!(error.message.contains("entrypoint gave up")),
            other => panic!("Expected Fault, got {:?}", other),
        }
        assert_eq!(worker.receive().unwrap(), Some(Message::Close));

        let reason = worker.reap(Duration::from_secs(5)).unwrap();
        assert_eq!(reason, TerminationReason::Exited(1));
    }

    #[test]
    fn test_panic_becomes_fault() {
        let _guard = fork_guard();
        let panicking = |_: &mut Worker| -> Result<()> { panic!("compiler bug") };
        let mut worker = Worker::spawn(0, &[], &panicking).unwrap();

        match worker.receive().unwrap() {
            Some(Message::Fault { error }) => assert!(error.message.contains("compiler bug")),
            other => panic!("Expected Fault, got {:?}", other),
        }
        worker.close();
        worker.reap(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_close_is_idempotent() {
        let _guard = fork_guard();
        let mut worker = Worker::spawn(0, &[], &echo).unwrap();
        worker.close();
        worker.close();
        worker.goodbye();
        assert!(worker.read_fd().is_none());
        assert!(worker.write_fd().is_none());
        assert!(!worker.is_idle());
        assert!(worker.reap(Duration::from_secs(5)).unwrap().is_terminal());
    }

    #[test]
    fn test_send_after_worker_exit_is_swallowed() {
        let _guard = fork_guard();
        let quitter = |_: &mut Worker| -> Result<()> { Ok(()) };
        let mut worker = Worker::spawn(0, &[], &quitter).unwrap();
        assert_eq!(worker.receive().unwrap(), Some(Message::Close));
        worker.reap(Duration::from_secs(5)).unwrap();

        // The child's read end is gone; the write must not error.
        let msg = Message::compile("root", "late", Default::default(), Default::default());
        worker.send(&msg).unwrap();
        assert!(worker.peer_gone());
    }

    #[test]
    fn test_wait_is_non_blocking() {
        let _guard = fork_guard();
        let sleeper = |w: &mut Worker| -> Result<()> {
            // Blocks until the orchestrator closes its side.
            while w.receive()?.is_some() {}
            Ok(())
        };
        let mut worker = Worker::spawn(0, &[], &sleeper).unwrap();
        assert_eq!(worker.wait().unwrap(), TerminationReason::StillAlive);
        worker.close();
        assert!(worker.reap(Duration::from_secs(5)).unwrap().is_success());
    }

    #[test]
    fn test_job_accounting() {
        let _guard = fork_guard();
        let mut worker = Worker::spawn(3, &[], &echo).unwrap();
        assert_eq!(worker.id(), 3);
        assert!(worker.is_idle());
        worker.begin_job();
        assert!(!worker.is_idle());
        assert_eq!(worker.in_flight(), 1);
        worker.finish_job();
        worker.finish_job();
        assert_eq!(worker.in_flight(), 0);
        assert_eq!(worker.orchestrator_fds().len(), 2);
    }
}
