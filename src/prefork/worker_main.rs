//! Receive loop run inside each forked worker.

use super::proc::{Role, Worker};
use super::protocol::Message;
use crate::compiler::{Autoloads, CompileError, CompileOptions, Compiler, RequireSink};
use crate::error::{ForkbuildError, RemoteError, Result};
use tracing::trace;

/// The worker side of a link forwards discovered requirements to the
/// top-level scheduler instead of scheduling them itself.
impl RequireSink for Worker {
    fn require(
        &mut self,
        origin: &str,
        requirements: Vec<String>,
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) -> Result<()> {
        if self.role() != Role::Worker {
            return Err(ForkbuildError::Protocol(
                "requirements can only be forwarded from inside a worker".into(),
            ));
        }
        if requirements.is_empty() {
            return Ok(());
        }
        self.send(&Message::NewRequires {
            origin: origin.to_string(),
            requirements,
            autoloads: autoloads.clone(),
            options: options.clone(),
        })
    }
}

/// Serve compile requests until the scheduler says goodbye.
///
/// Ends quietly when the scheduler closes its side or disappears.
pub fn compile_loop<C>(compiler: &C, worker: &mut Worker) -> Result<()>
where
    C: Compiler + ?Sized,
{
    while let Some(message) = worker.receive()? {
        match message {
            Message::Compile {
                origin,
                requirement,
                autoloads,
                options,
            } => {
                handle_compile(compiler, worker, &origin, &requirement, &autoloads, &options)?;
            }
            Message::Close => {
                worker.goodbye();
                break;
            }
            other => {
                return Err(ForkbuildError::Protocol(format!(
                    "worker received unexpected {} message",
                    other.kind()
                )));
            }
        }

        if worker.peer_gone() {
            break;
        }
    }
    Ok(())
}

/// Compile one requirement and report the outcome.
fn handle_compile<C>(
    compiler: &C,
    worker: &mut Worker,
    origin: &str,
    requirement: &str,
    autoloads: &Autoloads,
    options: &CompileOptions,
) -> Result<()>
where
    C: Compiler + ?Sized,
{
    trace!(pid = worker.pid().as_raw(), requirement, "Compiling");

    match compiler.compile(requirement, autoloads, options, worker) {
        Ok(unit) => {
            if let Some(unit) = &unit {
                worker.require(
                    &unit.filename,
                    unit.direct_requirements.clone(),
                    autoloads,
                    options,
                )?;
            }
            worker.send(&Message::NewAsset { unit })
        }
        Err(e @ CompileError::MissingRequire { .. }) => worker.send(&Message::MissingRequireError {
            origin: origin.to_string(),
            error: RemoteError::from_error(&e).with_captured_trace(),
        }),
        Err(e @ CompileError::Failed(_)) => worker.send(&Message::Fault {
            error: RemoteError::from_error(&e).with_captured_trace(),
        }),
    }
}
