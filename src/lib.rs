//! forkbuild - parallel requirement compilation over forked workers.
//!
//! A build starts from a root file's requirements. The [`prefork`]
//! scheduler hands each requirement to a pool of forked worker processes,
//! collects the requirements they discover in turn, compiles every file
//! exactly once, and finally restores the order a depth-first sequential
//! build would have produced.
//!
//! ```no_run
//! use forkbuild::{BuildContext, DirectiveCompiler, PreforkConfig, Scheduler};
//! use forkbuild::compiler::{Autoloads, CompileOptions};
//!
//! let compiler = DirectiveCompiler::new(["assets"]);
//! let mut ctx = BuildContext::new();
//! Scheduler::new(&compiler, PreforkConfig::default()).process_requires(
//!     &mut ctx,
//!     "app.js",
//!     &["lib/util".to_string()],
//!     &Autoloads::new(),
//!     &CompileOptions::new(),
//! )?;
//! print!("{}", ctx.concatenated());
//! # Ok::<(), forkbuild::ForkbuildError>(())
//! ```

pub mod compiler;
pub mod config;
pub mod directive;
pub mod error;
pub mod logging;
pub mod order;
pub mod prefork;

pub use compiler::{BuildContext, CompiledUnit, Compiler};
pub use config::PreforkConfig;
pub use directive::DirectiveCompiler;
pub use error::{ForkbuildError, Result};
pub use prefork::Scheduler;
