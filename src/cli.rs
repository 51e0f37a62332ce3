//! Command-line interface definitions using clap.

use clap::{Args, Parser, Subcommand};
use forkbuild::config::PreforkConfig;
use forkbuild::logging::LogFormat;
use std::path::{Path, PathBuf};

/// Compile a file's `require` graph in parallel across forked workers.
#[derive(Parser, Debug)]
#[command(name = "forkbuild")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_parser = parse_log_format, global = true)]
    pub log_format: Option<LogFormat>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile a root file and everything it requires.
    Build(BuildArgs),

    /// Print the ordered requirement ids of a root file, one per line.
    Graph(GraphArgs),
}

/// Options shared by every command that walks the graph.
#[derive(Args, Debug, Clone)]
pub struct GraphSource {
    /// Root file whose directives start the build.
    pub root: PathBuf,

    /// Directory to resolve requirements against (repeatable).
    ///
    /// The root file's own directory is always searched last.
    #[arg(short = 'I', long = "include", value_name = "PATH")]
    pub include: Vec<PathBuf>,

    /// Requirement already provided elsewhere; compiled to nothing.
    #[arg(long = "stub", value_name = "NAME")]
    pub stubs: Vec<String>,

    /// Maximum number of worker processes.
    #[arg(short = 'j', long, env = "FORKBUILD_WORKERS")]
    pub jobs: Option<usize>,

    /// Hide the progress line.
    #[arg(long)]
    pub no_progress: bool,
}

impl GraphSource {
    /// Load paths in search order.
    pub fn load_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.include.clone();
        let root_dir = self
            .root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        paths.push(root_dir.to_path_buf());
        paths
    }

    /// Scheduler configuration: environment first, then flags.
    pub fn prefork_config(&self) -> PreforkConfig {
        let mut config = PreforkConfig::new().with_env_overrides();
        if let Some(jobs) = self.jobs {
            config = config.with_workers(jobs);
        }
        if self.no_progress {
            config = config.with_progress(false);
        }
        config
    }
}

/// Arguments for the build command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: GraphSource,

    /// Write the concatenated output here instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

/// Arguments for the graph command.
#[derive(Args, Debug)]
pub struct GraphArgs {
    #[command(flatten)]
    pub source: GraphSource,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}
