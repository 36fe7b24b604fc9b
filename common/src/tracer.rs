// SPDX-FileCopyrightText: © 2024 Hugues Bruant <hugues.bruant@gmail.com>

//! Trace orchestrator: seeds the frontier from the entry files, fans out one
//! task per unseen file, and settles when the frontier is drained and all
//! in-flight work has completed. A `pending` set breaks cycles (a file seen
//! during its own descent only accumulates parents), a `traced` set prevents
//! re-parsing, and a semaphore bounds concurrent reads and parser
//! subprocesses.

use dashmap::DashSet;
use globset::{Glob, GlobSet, GlobSetBuilder};
use log::{debug, info};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use ustr::ustr;

use crate::cache::TraceCache;
use crate::errors::TraceError;
use crate::fileio::{FileIo, FileKind, OsFileIo};
use crate::parser::{extract_imports, FromName, ImportRecord};
use crate::pyenv;
use crate::resolver::{relative_start_dir, Resolution, Resolver};
use crate::results::{ReasonKind, ResultCollector, TraceResult};

#[derive(Clone)]
pub struct TraceOptions {
    /// anchor for relative paths and ignore-pattern matching [cwd]
    pub base: Option<PathBuf>,
    /// appended to the absolute-import search path after base
    pub extra_search_roots: Vec<PathBuf>,
    /// interpreter used for probing and structural parsing [PATH lookup]
    pub runtime_locator: Option<PathBuf>,
    pub follow_symlinks: bool,
    /// glob patterns matched against absolute and base-relative paths;
    /// matching files are kept in `reasons` flagged ignored, left out of
    /// `files`, and their imports are not traversed. Entry files are exempt
    pub ignore: Vec<String>,
    pub max_depth: usize,
    pub include_stdlib: bool,
    pub include_site_packages: bool,
    pub analyze_dynamic: bool,
    /// upper bound on parallel reads and parser subprocesses
    pub file_io_concurrency: usize,
    /// wall-clock limit per parser subprocess call
    pub parse_timeout: Duration,
    /// reusable caches for multi-trace workflows
    pub cache: Option<Arc<TraceCache>>,
    /// filesystem hooks; default hits the real filesystem
    pub io: Option<Arc<dyn FileIo>>,
    /// cooperative cancellation: when set, no new files are admitted and the
    /// partial result is returned once in-flight work settles
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for TraceOptions {
    fn default() -> TraceOptions {
        TraceOptions {
            base: None,
            extra_search_roots: Vec::new(),
            runtime_locator: None,
            follow_symlinks: true,
            ignore: Vec::new(),
            max_depth: 100,
            include_stdlib: false,
            include_site_packages: true,
            analyze_dynamic: true,
            file_io_concurrency: 1024,
            parse_timeout: Duration::from_secs(10),
            cache: None,
            io: None,
            cancel: None,
        }
    }
}

/// Lexical normalization: no filesystem access, so virtual trees behave the
/// same as real ones and symlinks are left to the I/O policy.
fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let mut out = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

struct TraceCtx {
    base: PathBuf,
    entries: HashSet<PathBuf>,
    ignore: GlobSet,
    io: Arc<dyn FileIo>,
    cache: Arc<TraceCache>,
    resolver: Resolver,
    collector: ResultCollector,
    pending: DashSet<PathBuf>,
    traced: DashSet<PathBuf>,
    gate: Semaphore,
    python: Option<PathBuf>,
    max_depth: usize,
    analyze_dynamic: bool,
    parse_timeout: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

type Frontier = UnboundedSender<(PathBuf, usize)>;

impl TraceCtx {
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if self.ignore.is_empty() {
            return false;
        }
        if self.ignore.is_match(path) {
            return true;
        }
        path.strip_prefix(&self.base)
            .is_ok_and(|rel| self.ignore.is_match(rel))
    }
}

/// Trace the import closure of `entry_files`.
///
/// Per-file problems (unreadable files, parser failures, over-depth,
/// non-literal dynamic imports) are reported through `TraceResult::warnings`;
/// imports that resolve to nothing land in `TraceResult::unresolved`. Only
/// invalid configuration and missing entry files are errors.
pub async fn trace(
    entry_files: &[PathBuf],
    options: TraceOptions,
) -> Result<TraceResult, TraceError> {
    if entry_files.is_empty() {
        return Err(TraceError::InvalidConfig(
            "at least one entry file is required".to_string(),
        ));
    }
    if options.file_io_concurrency == 0 {
        return Err(TraceError::InvalidConfig(
            "file_io_concurrency must be positive".to_string(),
        ));
    }

    let cwd = std::env::current_dir().map_err(|err| TraceError::Io {
        path: PathBuf::from("."),
        source: err,
    })?;
    let base = absolutize(options.base.as_deref().unwrap_or(&cwd), &cwd);

    let mut ignore_builder = GlobSetBuilder::new();
    for pattern in &options.ignore {
        let glob = Glob::new(pattern).map_err(|err| {
            TraceError::InvalidConfig(format!("bad ignore pattern {:?}: {}", pattern, err))
        })?;
        ignore_builder.add(glob);
    }
    let ignore = ignore_builder
        .build()
        .map_err(|err| TraceError::InvalidConfig(err.to_string()))?;

    let io: Arc<dyn FileIo> = options
        .io
        .clone()
        .unwrap_or_else(|| Arc::new(OsFileIo::new(options.follow_symlinks)));
    let cache = options
        .cache
        .clone()
        .unwrap_or_else(|| Arc::new(TraceCache::new()));

    let mut entries = Vec::with_capacity(entry_files.len());
    for entry in entry_files {
        let abs = absolutize(entry, &base);
        match io.stat(&abs) {
            Ok(FileKind::File) => entries.push(abs),
            _ => return Err(TraceError::MissingEntry(abs)),
        }
    }

    // one runtime snapshot per trace; reused across traces via the cache
    let env = if let Some(env) = cache.env.get() {
        env.clone()
    } else {
        let probed = Arc::new(
            pyenv::probe(options.runtime_locator.as_deref(), options.parse_timeout).await,
        );
        cache.env.get_or_init(|| probed).clone()
    };

    let collector = ResultCollector::default();
    for warning in &env.warnings {
        collector.warn(warning.clone());
    }

    let mut roots = vec![base.clone()];
    roots.extend(
        options
            .extra_search_roots
            .iter()
            .map(|root| absolutize(root, &base)),
    );
    if options.include_site_packages {
        roots.extend(env.site_roots.iter().cloned());
    }
    if options.include_stdlib {
        if let Some(stdlib_root) = &env.stdlib_root {
            roots.push(stdlib_root.clone());
        }
    }

    let resolver = Resolver::new(
        roots,
        options.include_stdlib,
        env.stdlib_names.clone(),
        io.clone(),
        cache.clone(),
    );

    let ctx = Arc::new(TraceCtx {
        base,
        entries: entries.iter().cloned().collect(),
        ignore,
        io,
        cache,
        resolver,
        collector,
        pending: DashSet::new(),
        traced: DashSet::new(),
        gate: Semaphore::new(options.file_io_concurrency),
        python: env.python.clone(),
        max_depth: options.max_depth,
        analyze_dynamic: options.analyze_dynamic,
        parse_timeout: options.parse_timeout,
        cancel: options.cancel.clone(),
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    for entry in entries {
        info!("entry: {}", entry.display());
        ctx.collector
            .record(&entry, ReasonKind::Entry, None, None, false);
        let _ = tx.send((entry, 0));
    }

    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        while let Ok((file, depth)) = rx.try_recv() {
            let ctx = ctx.clone();
            let tx = tx.clone();
            tasks.spawn(async move { process_file(ctx, tx, file, depth).await });
        }
        match tasks.join_next().await {
            Some(Ok(())) => {}
            Some(Err(err)) => ctx.collector.warn(format!("worker task failed: {}", err)),
            // no task is running, so nothing can enqueue more work
            None => {
                if rx.is_empty() {
                    break;
                }
            }
        }
    }

    Ok(ctx.collector.finalize())
}

async fn process_file(ctx: Arc<TraceCtx>, tx: Frontier, file: PathBuf, depth: usize) {
    if ctx.cancelled() || ctx.traced.contains(&file) {
        return;
    }
    // a file reached during its own descent only accumulates parents
    if !ctx.pending.insert(file.clone()) {
        return;
    }

    if depth > ctx.max_depth {
        ctx.collector.warn(format!(
            "max depth {} exceeded at {}",
            ctx.max_depth,
            file.display()
        ));
        ctx.pending.remove(&file);
        return;
    }

    // entry files are never ignored, even when re-reached through an
    // import: every entry stays in the file set no matter what patterns
    // are configured
    if !ctx.entries.contains(&file) && ctx.is_ignored(&file) {
        debug!("ignored: {}", file.display());
        ctx.collector.set_ignored(&file);
        ctx.traced.insert(file.clone());
        ctx.pending.remove(&file);
        return;
    }

    if let Some(records) = read_and_parse(&ctx, &file).await {
        for record in records.iter() {
            handle_import(&ctx, &tx, &file, depth, record);
        }
    }

    ctx.traced.insert(file.clone());
    ctx.pending.remove(&file);
}

async fn read_and_parse(ctx: &TraceCtx, file: &Path) -> Option<Arc<Vec<ImportRecord>>> {
    if let Some(parsed) = ctx.cache.parsed.get(file) {
        return Some(parsed.clone());
    }

    let permit = ctx.gate.acquire().await.ok()?;
    let content = match ctx.cache.contents.get(file) {
        Some(content) => content.clone(),
        None => match ctx.io.read_to_string(file) {
            Ok(content) => {
                let content = Arc::new(content);
                ctx.cache
                    .contents
                    .insert(file.to_path_buf(), content.clone());
                content
            }
            Err(err) => {
                drop(permit);
                // the file stays in the result; it was reached
                ctx.collector
                    .warn(format!("failed to read {}: {}", file.display(), err));
                return None;
            }
        },
    };

    let label = file.display().to_string();
    let (records, warnings) =
        extract_imports(ctx.python.as_deref(), &content, &label, ctx.parse_timeout).await;
    drop(permit);

    for warning in warnings {
        ctx.collector.warn(warning);
    }
    let records = Arc::new(records);
    ctx.cache.parsed.insert(file.to_path_buf(), records.clone());
    Some(records)
}

fn handle_import(
    ctx: &TraceCtx,
    tx: &Frontier,
    importer: &Path,
    depth: usize,
    record: &ImportRecord,
) {
    match record {
        ImportRecord::Plain { module, .. } => {
            resolve_and_record(
                ctx,
                tx,
                importer,
                depth,
                module,
                0,
                ReasonKind::PlainImport,
                &[],
            );
        }
        ImportRecord::From {
            base, level, names, ..
        } => {
            if *level > 0 {
                // the warning applies to the climbed-to starting directory,
                // the same one the resolver walks from
                let start = importer
                    .parent()
                    .and_then(|dir| relative_start_dir(dir, *level));
                if let Some(start) = start {
                    if !ctx.resolver.dir_is_package(&start) {
                        ctx.collector.warn(format!(
                            "relative import in {} resolved from {}, which is not a package",
                            importer.display(),
                            start.display()
                        ));
                    }
                }
            }
            let kind = if *level > 0 {
                ReasonKind::RelativeImport
            } else {
                ReasonKind::FromImport
            };
            resolve_and_record(ctx, tx, importer, depth, base, *level, kind, names);
        }
        ImportRecord::Dynamic { .. } => {
            if ctx.analyze_dynamic {
                handle_dynamic(ctx, tx, importer, depth, record);
            }
        }
    }
}

fn display_module(module: &str, level: u32) -> String {
    format!("{}{}", ".".repeat(level as usize), module)
}

/// Resolve one import, record its reason, enqueue the artifact, and promote
/// from-import names to submodules of a package base.
#[allow(clippy::too_many_arguments)]
fn resolve_and_record(
    ctx: &TraceCtx,
    tx: &Frontier,
    importer: &Path,
    depth: usize,
    module: &str,
    level: u32,
    kind: ReasonKind,
    names: &[FromName],
) {
    if ctx.resolver.is_suppressed_stdlib(module, level) {
        debug!("suppressed stdlib import {} in {}", module, importer.display());
        return;
    }

    let resolution = ctx.resolver.resolve(module, level, Some(importer));
    let display = display_module(module, level);
    let resolved = record_resolution(ctx, tx, importer, depth, &resolution, kind, &display);

    if resolution.package_dir().is_some() {
        for name in names.iter().filter(|n| !n.is_wildcard()) {
            let sub = ctx.resolver.probe_submodule(&resolution, &name.name);
            if matches!(sub, Resolution::Unresolved) {
                // ordinary attribute, not a submodule
                continue;
            }
            let sub_display = if display.is_empty() || display.ends_with('.') {
                format!("{}{}", display, name.name)
            } else {
                format!("{}.{}", display, name.name)
            };
            record_resolution(
                ctx,
                tx,
                importer,
                depth,
                &sub,
                ReasonKind::FromImport,
                &sub_display,
            );
        }
    }

    if !resolved {
        ctx.collector.add_unresolved(ustr(&display), importer);
    }
}

fn record_resolution(
    ctx: &TraceCtx,
    tx: &Frontier,
    importer: &Path,
    depth: usize,
    resolution: &Resolution,
    kind: ReasonKind,
    module_name: &str,
) -> bool {
    match resolution {
        Resolution::File { path } => {
            ctx.collector
                .record(path, kind, Some(importer), Some(module_name), false);
            enqueue(ctx, tx, path, depth + 1);
            true
        }
        Resolution::RegularPackage { init_path, .. } => {
            ctx.collector
                .record(init_path, kind, Some(importer), Some(module_name), true);
            enqueue(ctx, tx, init_path, depth + 1);
            true
        }
        Resolution::NamespacePackage { dir } => {
            // marks the directory's existence only; its contents are not
            // scanned and nothing is enqueued
            ctx.collector.record(
                dir,
                ReasonKind::NamespaceMarker,
                Some(importer),
                Some(module_name),
                false,
            );
            true
        }
        Resolution::Unresolved => false,
    }
}

fn enqueue(ctx: &TraceCtx, tx: &Frontier, file: &Path, depth: usize) {
    if ctx.traced.contains(file) {
        return;
    }
    let _ = tx.send((file.to_path_buf(), depth));
}

fn handle_dynamic(
    ctx: &TraceCtx,
    tx: &Frontier,
    importer: &Path,
    depth: usize,
    record: &ImportRecord,
) {
    let ImportRecord::Dynamic {
        module,
        package,
        level,
        path,
        expression,
        line,
        ..
    } = record
    else {
        return;
    };

    if let Some(path_lit) = path {
        // runpy.run_path takes a file path, not a module name
        let anchor = importer.parent().unwrap_or(Path::new("/"));
        let target = absolutize(Path::new(path_lit), anchor);
        if matches!(ctx.io.stat(&target), Ok(FileKind::File)) {
            ctx.collector.record(
                &target,
                ReasonKind::DynamicImport,
                Some(importer),
                Some(path_lit),
                false,
            );
            enqueue(ctx, tx, &target, depth + 1);
        } else {
            ctx.collector.add_unresolved(ustr(path_lit), importer);
        }
        return;
    }

    if let Some(module) = module {
        let (name, lvl) = if *level > 0 {
            match package {
                // anchor a dotted-relative module at the named package
                Some(pkg) => {
                    let mut parts: Vec<&str> = pkg.split('.').collect();
                    for _ in 1..*level {
                        parts.pop();
                    }
                    let mut anchored = parts.join(".");
                    if !module.is_empty() {
                        if !anchored.is_empty() {
                            anchored.push('.');
                        }
                        anchored.push_str(module);
                    }
                    (anchored, 0)
                }
                None => (module.clone(), *level),
            }
        } else {
            (module.clone(), 0)
        };
        if name.is_empty() && lvl == 0 {
            return;
        }
        resolve_and_record(
            ctx,
            tx,
            importer,
            depth,
            &name,
            lvl,
            ReasonKind::DynamicImport,
            &[],
        );
        return;
    }

    if let Some(expr) = expression {
        ctx.collector.warn(format!(
            "{}:{}: dynamic import with non-literal argument `{}` cannot be resolved",
            importer.display(),
            line,
            expr
        ));
    }
}
