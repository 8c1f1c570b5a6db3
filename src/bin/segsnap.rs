// Copyright (c) 2024-present, segsnap authors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Command-line front end: parses argv into a validated [`segsnap::Options`],
//! drives one or more namespace names through [`segsnap::driver`], and maps
//! the outcome onto a process exit code.

use clap::{ArgAction, ArgGroup, Parser};
use humansize::{SizeFormatter, BINARY};
use segsnap::config::{Mode, Options};
use segsnap::driver;
use segsnap::error::Error;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
    registry::Registry,
};

macro_rules! die {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        eprintln!($fmt $(, $arg)*);
        std::process::exit(1);
    }};
}

#[derive(Parser, Debug)]
#[command(name = "segsnap")]
#[command(about = "Backs up or restores a database server's shared-memory index segments")]
#[command(group(ArgGroup::new("mode").args(["backup", "restore"]).required(true)))]
struct Args {
    /// Analyze only: print the planned commands, perform no I/O
    #[arg(short = 'a', long)]
    analyze: bool,

    /// Backup mode: shared memory to files
    #[arg(short = 'b', long)]
    backup: bool,

    /// Restore mode: files to shared memory
    #[arg(short = 'r', long)]
    restore: bool,

    /// Compute and cross-check CRC32 on both sides
    #[arg(short = 'c', long)]
    crc_check: bool,

    /// Filter by instance, 0..=15
    #[arg(short = 'i', long, default_value_t = 0)]
    instance: u8,

    /// Comma-separated list of namespace names
    #[arg(short = 'n', long, value_delimiter = ',', required = true)]
    names: Vec<String>,

    /// Directory holding the `<key>.dat[.gz]` files
    #[arg(short = 'p', long)]
    directory: PathBuf,

    /// Parallelism bound, 1..=1024 (default: host CPU count)
    #[arg(short = 't', long)]
    thread_bound: Option<usize>,

    /// Suppress all output except for errors; overrides -v
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Verbose output; supply multiple times to increase verbosity
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Gzip the stage files on backup (ignored on restore)
    #[arg(short = 'z', long)]
    gzip: bool,
}

/// Mirrors the teacher's `tool.rs::init_tracing`: `-q` forces `ERROR` and
/// wins over any number of `-v`; otherwise each `-v` raises the level one
/// notch past `WARN`. Returns whether summary output should be printed.
fn init_tracing(quiet: bool, verbose: u8) -> (bool, LevelFilter) {
    let is_verbose = !quiet && verbose > 0;

    let level_filter = if quiet {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };

    tracing_log::LogTracer::init().expect("failed to install log tracer");

    let registry = Registry::default();
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .with_env_var("SEGSNAP_LOG")
        .from_env_lossy();

    let subscriber = registry.with(env_filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact(),
    );

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        die!("internal error: setting default tracing subscriber failed");
    }

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing_panic::panic_hook(info);
        prev_hook(info);
    }));

    (is_verbose, level_filter)
}

fn build_options(args: &Args, verbose: bool) -> Options {
    let mode = if args.backup { Mode::Backup } else { Mode::Restore };
    let thread_bound = args.thread_bound.unwrap_or_else(num_cpus::get);

    let options = match Options::new(mode, args.directory.clone(), args.instance, args.names.clone(), thread_bound) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("usage error: {e}");
            std::process::exit(1);
        }
    };

    options
        .analyze_only(args.analyze)
        .with_crc_check(args.crc_check)
        .with_gzip(args.gzip)
        .verbosely(verbose)
}

fn main() {
    let args = Args::parse();
    let (verbose, level_filter) = init_tracing(args.quiet, args.verbose);

    info!(
        "starting {} {}, log level {level_filter}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let options = build_options(&args, verbose);

    let mut failures = 0usize;
    for name in &options.namespace_names {
        match driver::run_namespace(&options, name) {
            Ok(summary) => {
                if summary.analyzed {
                    for command in &summary.commands {
                        println!("{command}");
                    }
                } else if options.verbose {
                    println!(
                        "{}: moved {} members, {} in {:.2}s",
                        name,
                        summary.members_moved,
                        SizeFormatter::new(summary.bytes_transferred, BINARY),
                        summary.elapsed.as_secs_f64(),
                    );
                }
            }
            // Misuse/Environment are host- or invocation-level problems, not
            // per-namespace ones: retrying the next name would just hit the
            // same broken directory or kernel table, so stop right here.
            Err(e @ (Error::Misuse(_) | Error::Environment(_))) => {
                error!(namespace = %name, error = %e, "aborting: environment or usage error");
                eprintln!("{name}: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                failures += 1;
                if options.verbose {
                    eprintln!("{name}: {e}");
                }
                error!(namespace = %name, error = %e, "namespace operation failed");
            }
        }
    }

    if failures > 0 {
        warn!(failures, total = options.namespace_names.len(), "one or more namespaces failed");
        std::process::exit(1);
    }
}
