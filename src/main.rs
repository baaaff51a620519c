//! A minimal smoke-test binary for `ninjacore`: parse a manifest, scan and
//! plan the requested targets, run them through the real `ProcessRunner`,
//! and print a one-line summary. Flag parity with a real `ninja` binary
//! (`-j`/`-k`/`-d`/`-w`, colorized status, subcommands) is deliberately out
//! of scope here — that's the external CLI's job, not this library's.

use anyhow::Result;
use argh::FromArgs;
use ninjacore::builder::{BuildConfig, Builder};
use ninjacore::buildlog::BuildLogWriter;
use ninjacore::canon::canon_path;
use ninjacore::depslog::{self, DepsLog, DepsLogWriter};
use ninjacore::disk::RealDisk;
use ninjacore::graph::State;
use ninjacore::parse::{parse_manifest, StrictMode};
use ninjacore::subprocess::ProcessRunner;

/// build one or more targets from a ninja-compatible manifest
#[derive(FromArgs)]
struct Args {
    /// path to the manifest (default: build.ninja)
    #[argh(option, short = 'f', default = "String::from(\"build.ninja\")")]
    file: String,

    /// number of commands to run in parallel
    #[argh(option, short = 'j', default = "1")]
    parallelism: usize,

    /// keep going after this many failures
    #[argh(option, short = 'k', default = "1")]
    keep_going: usize,

    /// print what would run without running it
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// targets to build (default: the manifest's own defaults)
    #[argh(positional)]
    targets: Vec<String>,
}

fn open_deps_log(path: &str) -> Result<(DepsLog, DepsLogWriter)> {
    let result = depslog::load(path)?;
    if let Some(warning) = &result.warning {
        eprintln!("ninjacore: {path}: {warning}, recovering");
    }
    let writer = if std::path::Path::new(path).exists() {
        DepsLogWriter::open_append(path)?
    } else {
        DepsLogWriter::create(path)?
    };
    Ok((result.log, writer))
}

fn main() -> Result<()> {
    ninjacore::signal::register_sigint();
    let _ = ninjacore::trace::open(".ninjacore_trace");

    let args: Args = argh::from_env();

    let disk = RealDisk;
    let mut state = State::new();
    parse_manifest(&mut state, &disk, &args.file, StrictMode::default())?;

    let targets: Vec<_> = if args.targets.is_empty() {
        state.default_targets.clone()
    } else {
        args.targets
            .iter()
            .map(|t| {
                let (canonical, bits) = canon_path(t)?;
                Ok(state.get_node(&canonical, bits))
            })
            .collect::<Result<Vec<_>>>()?
    };
    if targets.is_empty() {
        anyhow::bail!("no targets to build and manifest declares no default targets");
    }

    let (build_log, build_log_writer) = BuildLogWriter::open(".ninjacore_log")?;
    let (deps_log, deps_log_writer) = open_deps_log(".ninjacore_deps")?;

    let config = BuildConfig {
        failures_allowed: args.keep_going,
        dry_run: args.dry_run,
    };
    let mut builder = Builder::new(
        &disk,
        build_log,
        Some(build_log_writer),
        deps_log,
        Some(deps_log_writer),
        config,
    );
    let mut runner = ProcessRunner::new(args.parallelism.max(1));
    for target in &targets {
        builder.add_target(&mut state, *target, &mut runner)?;
    }

    let wanted = builder.wanted_edges();
    let stats = builder.build(&mut state, &mut runner)?;
    println!(
        "ninjacore: {} commands run, {} skipped, {} failed ({} edges wanted)",
        stats.commands_run, stats.edges_skipped, stats.failures, wanted
    );

    let _ = ninjacore::trace::close();
    if stats.failures > 0 {
        anyhow::bail!("build failed");
    }
    Ok(())
}
