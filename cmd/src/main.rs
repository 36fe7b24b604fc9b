use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Duration;

use common::results::{ReasonKind, TraceResult};
use common::tracer::{trace, TraceOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// newline-delimited file list
    List,
    /// JSON object mirroring the result shape
    Json,
    /// per-file inclusion reasons
    Reasons,
}

/// Trace which files on disk are required to run a set of python entry
/// points, without executing any of them.
#[derive(Parser)]
#[command(name = "pytrace", version)]
struct Cli {
    /// entry-point source files
    #[arg(required = true)]
    entries: Vec<PathBuf>,

    /// anchor for relative paths and ignore patterns [default: cwd]
    #[arg(long)]
    base: Option<PathBuf>,

    /// extra absolute-import search roots, searched after the base
    #[arg(long = "search-root", value_name = "DIR")]
    search_roots: Vec<PathBuf>,

    /// interpreter used for environment probing and structural parsing
    #[arg(long, value_name = "PATH")]
    python: Option<PathBuf>,

    /// glob pattern for files to record but never traverse (repeatable)
    #[arg(long, value_name = "GLOB")]
    ignore: Vec<String>,

    #[arg(long, default_value_t = 100)]
    max_depth: usize,

    /// make standard-library modules resolvable and traced
    #[arg(long)]
    include_stdlib: bool,

    /// drop site-packages roots from the search path
    #[arg(long)]
    no_site_packages: bool,

    /// skip recognized dynamic-import idioms
    #[arg(long)]
    no_dynamic: bool,

    /// do not dereference symlinks during resolution
    #[arg(long)]
    no_follow_symlinks: bool,

    /// upper bound on parallel file i/o and parser subprocesses
    #[arg(long, default_value_t = 1024)]
    concurrency: usize,

    /// per-file parser subprocess timeout, in seconds
    #[arg(long, default_value_t = 10, value_name = "SECS")]
    parse_timeout: u64,

    #[arg(long, value_enum, default_value_t = Format::List)]
    format: Format,

    /// more logging (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn setup_logger(verbose: u8, quiet: bool) -> Result<(), log::SetLoggerError> {
    let level = if quiet {
        log::LevelFilter::Error
    } else {
        match verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    };
    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("{}: {}", record.level(), message)))
        .level(level)
        .chain(std::io::stderr())
        .apply()
}

fn display_path(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn kind_label(kind: ReasonKind) -> &'static str {
    match kind {
        ReasonKind::Entry => "entry",
        ReasonKind::PlainImport => "plain_import",
        ReasonKind::FromImport => "from_import",
        ReasonKind::RelativeImport => "relative_import",
        ReasonKind::DynamicImport => "dynamic_import",
        ReasonKind::NamespaceMarker => "namespace_marker",
    }
}

fn emit(result: &TraceResult, format: Format, base: &Path) -> anyhow::Result<()> {
    match format {
        Format::List => {
            for file in &result.files {
                println!("{}", display_path(file, base));
            }
        }
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        Format::Reasons => {
            for (path, reason) in &result.reasons {
                let mut markers = vec![kind_label(reason.kind).to_string()];
                if reason.package_init {
                    markers.push("package_init".to_string());
                }
                if reason.ignored {
                    markers.push("ignored".to_string());
                }
                let mut line = format!("{}: {}", display_path(path, base), markers.join("+"));
                if let Some(module) = &reason.module_name {
                    line.push_str(&format!(" ({})", module));
                }
                if !reason.parents.is_empty() {
                    let parents: Vec<String> = reason
                        .parents
                        .iter()
                        .map(|p| display_path(p, base))
                        .collect();
                    line.push_str(&format!(" <- {}", parents.join(", ")));
                }
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let base = cli.base.clone().unwrap_or(cwd);

    let options = TraceOptions {
        base: Some(base.clone()),
        extra_search_roots: cli.search_roots.clone(),
        runtime_locator: cli.python.clone(),
        follow_symlinks: !cli.no_follow_symlinks,
        ignore: cli.ignore.clone(),
        max_depth: cli.max_depth,
        include_stdlib: cli.include_stdlib,
        include_site_packages: !cli.no_site_packages,
        analyze_dynamic: !cli.no_dynamic,
        file_io_concurrency: cli.concurrency,
        parse_timeout: Duration::from_secs(cli.parse_timeout),
        ..TraceOptions::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let result = runtime.block_on(trace(&cli.entries, options))?;

    emit(&result, cli.format, &base)?;
    if cli.format != Format::Json && !cli.quiet {
        for warning in &result.warnings {
            eprintln!("warning: {}", warning);
        }
        for (module, importers) in &result.unresolved {
            for importer in importers {
                eprintln!("unresolved: {} (from {})", module, display_path(importer, &base));
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = setup_logger(cli.verbose, cli.quiet) {
        eprintln!("pytrace: failed to set up logging: {}", err);
    }
    // tracing completes with exit 0 even when warnings or unresolved
    // imports remain; only argument and fatal i/o errors are non-zero
    if let Err(err) = run(cli) {
        eprintln!("pytrace: {:#}", err);
        exit(1);
    }
}
