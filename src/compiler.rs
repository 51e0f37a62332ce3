//! Collaborator contract between the scheduler and the hosting builder.
//!
//! The scheduler never compiles anything itself. It asks a [`Compiler`] to
//! turn one requirement into a [`CompiledUnit`], and keeps the shared
//! build state in a [`BuildContext`] owned by whoever drives the build.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Lazily resolvable constants, passed through to the compiler untouched.
pub type Autoloads = BTreeMap<String, String>;

/// Free-form compiler options, passed through untouched.
pub type CompileOptions = serde_json::Map<String, serde_json::Value>;

/// One compiled output plus its own direct requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledUnit {
    /// Canonical identifier of the compiled file.
    pub filename: String,
    /// Requirements in the order the source declared them.
    pub direct_requirements: Vec<String>,
    /// Compiled output.
    pub payload: String,
}

impl CompiledUnit {
    pub fn new(
        filename: impl Into<String>,
        direct_requirements: Vec<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            direct_requirements,
            payload: payload.into(),
        }
    }
}

/// Failure raised by a [`Compiler`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The requirement could not be resolved to a file.
    #[error("can't find file: {requirement:?} ({message})")]
    MissingRequire { requirement: String, message: String },

    #[error("{0}")]
    Failed(String),
}

/// Where newly discovered requirements get reported.
///
/// Inside a worker process this is the link back to the top-level
/// scheduler; a compiler must never start a scheduler of its own.
pub trait RequireSink {
    fn require(
        &mut self,
        origin: &str,
        requirements: Vec<String>,
        autoloads: &Autoloads,
        options: &CompileOptions,
    ) -> crate::error::Result<()>;
}

/// The source-to-source compilation service.
///
/// `compile` runs inside forked worker processes, so implementations must
/// tolerate being invoked concurrently from several processes. `expand`
/// runs in the orchestrator and must be pure.
pub trait Compiler {
    /// Canonicalize a requirement name to the identifier its unit will carry.
    fn expand(&self, name: &str) -> String;

    /// Compile one requirement.
    ///
    /// Returns `Ok(None)` when the requirement is already satisfied
    /// elsewhere. Requirements discovered beyond the unit's own
    /// `direct_requirements` are reported through `sink`.
    fn compile(
        &self,
        requirement: &str,
        autoloads: &Autoloads,
        options: &CompileOptions,
        sink: &mut dyn RequireSink,
    ) -> Result<Option<CompiledUnit>, CompileError>;
}

/// Build state shared between the hosting builder and the scheduler.
#[derive(Debug, Default)]
pub struct BuildContext {
    /// Requirement identifiers already dispatched for compilation.
    pub already_processed: HashSet<String>,
    /// Compiled units in sequential-equivalent order.
    pub processed: Vec<CompiledUnit>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concatenate every processed payload in order.
    pub fn concatenated(&self) -> String {
        let mut out = String::new();
        for unit in &self.processed {
            out.push_str(&unit.payload);
            if !unit.payload.is_empty() && !unit.payload.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}
