//! forkbuild - parallel requirement compilation

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::json;
use std::fs;
use std::io::Write;
use tracing::info;

use cli::{Cli, Commands, GraphSource};
use forkbuild::compiler::{Autoloads, CompileOptions};
use forkbuild::directive::STUBS_OPTION;
use forkbuild::logging::{self, LogConfig};
use forkbuild::prefork::RunSummary;
use forkbuild::{BuildContext, DirectiveCompiler, ForkbuildError, Scheduler};

/// Parse arguments, run the selected command and report failures with
/// their cause chain.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let mut log_config = LogConfig::for_verbosity(cli.verbose, cli.quiet).with_env_overrides();
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config);

    let result = match &cli.command {
        Commands::Build(args) => cmd_build(&cli, args),
        Commands::Graph(args) => cmd_graph(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            print_cause(cause);
        }
        if let Some(remote) = e
            .downcast_ref::<ForkbuildError>()
            .and_then(ForkbuildError::remote)
        {
            for cause in &remote.chain {
                print_cause(cause);
            }
            if cli.verbose >= 2
                && let Some(trace) = &remote.trace
            {
                eprintln!(
                    "  {}:\n{}",
                    "worker backtrace".if_supports_color(Stderr, |text| text.yellow()),
                    trace
                );
            }
        }
        std::process::exit(1);
    }
}

fn print_cause(cause: impl std::fmt::Display) {
    eprintln!(
        "  {}: {}",
        "caused by".if_supports_color(Stderr, |text| text.yellow()),
        cause
    );
}

/// Compile the root's requirement graph into `ctx`, root last.
fn compile_graph(source: &GraphSource) -> Result<(BuildContext, RunSummary)> {
    let compiler = DirectiveCompiler::new(source.load_paths());
    let root = compiler
        .compile_path(&source.root)
        .with_context(|| format!("failed to load root file {}", source.root.display()))?;

    let mut options = CompileOptions::new();
    if !source.stubs.is_empty() {
        options.insert(STUBS_OPTION.to_string(), json!(source.stubs));
    }

    let mut ctx = BuildContext::new();
    // A requirement cycle back to the root must not compile it twice.
    ctx.already_processed.insert(root.filename.clone());

    let summary = Scheduler::new(&compiler, source.prefork_config()).process_requires(
        &mut ctx,
        &root.filename,
        &root.direct_requirements,
        &Autoloads::new(),
        &options,
    )?;
    ctx.processed.push(root);

    info!(
        files = ctx.processed.len(),
        workers = summary.workers_spawned,
        "Build complete"
    );
    Ok((ctx, summary))
}

fn cmd_build(cli: &Cli, args: &cli::BuildArgs) -> Result<()> {
    let (ctx, summary) = compile_graph(&args.source)?;
    let output = ctx.concatenated();

    match &args.output {
        Some(path) => {
            fs::write(path, &output)
                .with_context(|| format!("failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!(
                    "{} {} files using {} worker(s) into {}",
                    "Compiled".if_supports_color(Stderr, |text| text.green()),
                    ctx.processed.len(),
                    summary.workers_spawned,
                    path.display()
                );
            }
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(output.as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn cmd_graph(args: &cli::GraphArgs) -> Result<()> {
    let (ctx, _) = compile_graph(&args.source)?;
    let mut stdout = std::io::stdout().lock();
    for unit in &ctx.processed {
        writeln!(stdout, "{}", unit.filename)?;
    }
    Ok(())
}
