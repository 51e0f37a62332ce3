//! A small directive-driven compiler.
//!
//! Source files declare what they depend on with header lines such as
//!
//! ```text
//! //= require lib/util
//! #= require vendor/jquery.js
//! ```
//!
//! Compiling a file strips those lines and reports the named files as its
//! direct requirements, in the order they were written.

use crate::compiler::{
    Autoloads, CompileError, CompileOptions, CompiledUnit, Compiler, RequireSink,
};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Extensions tried when a requirement names a file without one.
pub const DEFAULT_EXTENSIONS: &[&str] = &["js", "rb"];

/// Key in [`CompileOptions`] holding extra stub names.
pub const STUBS_OPTION: &str = "stubs";

/// Resolves requirement names against a list of load paths.
#[derive(Debug, Clone)]
pub struct DirectiveCompiler {
    load_paths: Vec<PathBuf>,
    extensions: Vec<String>,
    stubs: HashSet<String>,
}

impl DirectiveCompiler {
    pub fn new<I, P>(load_paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            load_paths: load_paths.into_iter().map(Into::into).collect(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            stubs: HashSet::new(),
        }
    }

    /// Replace the extensions tried during resolution.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_string())
            .collect();
        self
    }

    /// Treat `name` as already provided elsewhere.
    pub fn with_stub(mut self, name: &str) -> Self {
        let id = self.expand(name);
        self.stubs.insert(id);
        self
    }

    pub fn load_paths(&self) -> &[PathBuf] {
        &self.load_paths
    }

    /// Find the file a requirement refers to.
    ///
    /// The name is tried as written and then with each extension, in every
    /// load path in order. The first existing file wins.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let name = strip_dot_slash(name);
        for dir in &self.load_paths {
            let exact = dir.join(name);
            if exact.is_file() {
                return Some(exact);
            }
            for ext in &self.extensions {
                let candidate = dir.join(format!("{}.{}", name, ext));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Parse the file at `path` into a unit without resolving it.
    ///
    /// Used for the root of a build, which is named by path rather than by
    /// requirement. The unit gets the id a requirement resolving to the same
    /// file would get, so a cycle back to the root is recognised.
    pub fn compile_path(&self, path: &Path) -> Result<CompiledUnit, CompileError> {
        let source = fs::read_to_string(path)
            .map_err(|e| CompileError::Failed(format!("{}: {}", path.display(), e)))?;
        let (requirements, payload) = parse_directives(&source);
        let name = self.name_for_path(path);
        Ok(CompiledUnit::new(self.expand(&name), requirements, payload))
    }

    /// `path` relative to the first load path containing it, `/`-separated.
    ///
    /// Falls back to the bare file name when no load path contains it.
    pub fn name_for_path(&self, path: &Path) -> String {
        let file = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        for dir in &self.load_paths {
            let dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
            if let Ok(relative) = file.strip_prefix(&dir)
                && !relative.as_os_str().is_empty()
            {
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                return parts.join("/");
            }
        }
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    }

    fn is_stub(&self, id: &str, options: &CompileOptions) -> bool {
        if self.stubs.contains(id) {
            return true;
        }
        options
            .get(STUBS_OPTION)
            .and_then(|v| v.as_array())
            .is_some_and(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str())
                    .any(|n| self.expand(n) == id)
            })
    }
}

impl Compiler for DirectiveCompiler {
    /// `./lib/util.js` and `lib/util` both become `lib/util`.
    fn expand(&self, name: &str) -> String {
        let name = strip_dot_slash(name.trim());
        for ext in &self.extensions {
            if let Some(stem) = name
                .strip_suffix(ext.as_str())
                .and_then(|s| s.strip_suffix('.'))
                .filter(|s| !s.is_empty())
            {
                return stem.to_string();
            }
        }
        name.to_string()
    }

    fn compile(
        &self,
        requirement: &str,
        _autoloads: &Autoloads,
        options: &CompileOptions,
        _sink: &mut dyn RequireSink,
    ) -> Result<Option<CompiledUnit>, CompileError> {
        let id = self.expand(requirement);
        if self.is_stub(&id, options) {
            trace!(requirement, "Stubbed");
            return Ok(None);
        }

        let Some(path) = self.resolve(requirement) else {
            return Err(CompileError::MissingRequire {
                requirement: requirement.to_string(),
                message: format!("searched {} load path(s)", self.load_paths.len()),
            });
        };

        let source = fs::read_to_string(&path)
            .map_err(|e| CompileError::Failed(format!("{}: {}", path.display(), e)))?;
        let (requirements, payload) = parse_directives(&source);
        Ok(Some(CompiledUnit::new(id, requirements, payload)))
    }
}

/// Split source into its `require` directives and the remaining lines.
pub fn parse_directives(source: &str) -> (Vec<String>, String) {
    let mut requirements = Vec::new();
    let mut body = Vec::new();
    for line in source.lines() {
        match directive_target(line) {
            Some(name) => requirements.push(name.to_string()),
            None => body.push(line),
        }
    }
    let mut payload = body.join("\n");
    if !payload.is_empty() {
        payload.push('\n');
    }
    (requirements, payload)
}

fn directive_target(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let rest = line
        .strip_prefix("//=")
        .or_else(|| line.strip_prefix("#="))?
        .trim_start();
    let name = rest.strip_prefix("require")?;
    // `require_tree` and friends are not supported.
    if !name.starts_with(char::is_whitespace) {
        return None;
    }
    let name = name.trim().trim_matches(|c| c == '"' || c == '\'');
    (!name.is_empty()).then_some(name)
}

fn strip_dot_slash(mut name: &str) -> &str {
    while let Some(rest) = name.strip_prefix("./") {
        name = rest;
    }
    name
}
