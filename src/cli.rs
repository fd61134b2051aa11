// Command-line front end for a local chunksync store.
//
// Subcommands map one-to-one onto engine operations (projects,
// containers, push, cat, merge) plus the standalone signature/diff/apply
// file tools.  Every command returns an exit code; errors are printed
// as `chunksync: <context>: <error>`.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use std::time::UNIX_EPOCH;

use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};

use crate::chunker::Chunker;
use crate::engine::{EngineOptions, SyncEngine};
use crate::hash::config::DEFAULT_AVERAGE_SIZE;
use crate::hash::{ChunkerConfig, PathHash};
use crate::manifest::{FileEntry, FileMetadata, manifest_path_hash};
use crate::store::Scope;

const DEFAULT_ROOT: &str = "chunksync-data";
const DEFAULT_WORKERS: usize = 64;

// ---------------------------------------------------------------------------
// Byte size parsing (supports K, M, G suffixes)
// ---------------------------------------------------------------------------

fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".into());
    }
    let (num_part, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };
    let num: u64 = num_part
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflow: '{s}'"))
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Versioned file store built on content-defined chunking and deltas.
#[derive(Parser, Debug)]
#[command(
    name = "chunksync",
    version,
    about = "Chunked delta storage for versioned project files",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Store root directory.
    #[arg(long, global = true, env = "CHUNKSYNC_ROOT", default_value = DEFAULT_ROOT, value_hint = ValueHint::DirPath)]
    root: PathBuf,

    /// Worker threads for multi-file push and merge.
    #[arg(long, global = true, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Average chunk size (supports K/M/G suffix, power of two).
    #[arg(long = "avg-chunk-size", global = true, value_parser = parse_byte_size, default_value_t = DEFAULT_AVERAGE_SIZE as u64)]
    avg_chunk_size: u64,

    /// Quiet mode (suppress non-error output).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use multiple times for more detail).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output stats as JSON to stderr.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create a project.
    InitProject(NameArgs),
    /// Create a container on top of the project's current commit.
    Create(ContainerArgs),
    /// Push files into a container as one new change.
    Push(PushArgs),
    /// Print a file at a commit or container version.
    Cat(CatArgs),
    /// Merge a container into a new commit.
    Merge(ContainerArgs),
    /// Show commits and open containers of a project.
    Log(NameArgs),
    /// Delete a container, or a whole project.
    Delete(DeleteArgs),
    /// Write the signature of a file.
    Signature(SignatureArgs),
    /// Diff a file against a signature, writing a delta file.
    Diff(DiffArgs),
    /// Apply a delta file to an original.
    Apply(ApplyArgs),
}

#[derive(Args, Debug)]
struct NameArgs {
    /// Project name.
    project: String,
}

#[derive(Args, Debug)]
struct ContainerArgs {
    /// Project name.
    project: String,
    /// Container (branch or workspace) name.
    container: String,
}

#[derive(Args, Debug)]
struct PushArgs {
    #[command(flatten)]
    target: ContainerArgs,

    /// Files to upload; stored under the path as given.
    #[arg(value_hint = ValueHint::FilePath)]
    files: Vec<PathBuf>,

    /// Logical paths to mark as removed.
    #[arg(long = "remove", value_name = "PATH")]
    remove: Vec<String>,

    /// Change id to write (default: next change).
    #[arg(long)]
    change: Option<u64>,

    /// Do not update the stored manifest.
    #[arg(long = "no-manifest")]
    no_manifest: bool,
}

#[derive(Args, Debug)]
struct CatArgs {
    /// Project name.
    project: String,
    /// Logical path.
    path: String,

    /// Read from a container instead of the commit history.
    #[arg(long)]
    container: Option<String>,

    /// Commit id (default: current commit).
    #[arg(long, conflicts_with = "container")]
    commit: Option<u64>,

    /// Container change id (default: latest change).
    #[arg(long, requires = "container")]
    change: Option<u64>,

    /// Write to a file instead of stdout.
    #[arg(short = 'o', long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    /// Project name.
    project: String,
    /// Container to delete; the whole project if omitted.
    container: Option<String>,
}

#[derive(Args, Debug)]
struct SignatureArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    #[arg(value_hint = ValueHint::FilePath)]
    signature: PathBuf,
}

#[derive(Args, Debug)]
struct DiffArgs {
    /// New version of the file.
    #[arg(value_hint = ValueHint::FilePath)]
    source: PathBuf,
    /// Signature of the version the recipient holds.
    #[arg(value_hint = ValueHint::FilePath)]
    signature: PathBuf,
    #[arg(value_hint = ValueHint::FilePath)]
    delta: PathBuf,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    original: PathBuf,
    #[arg(value_hint = ValueHint::FilePath)]
    delta: PathBuf,
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

// ---------------------------------------------------------------------------
// Resolved options
// ---------------------------------------------------------------------------

struct Options {
    engine: EngineOptions,
    quiet: bool,
    verbose: u8,
    json_output: bool,
}

fn resolve_options(cli: &Cli) -> Result<Options, String> {
    let avg = usize::try_from(cli.avg_chunk_size).map_err(|_| "chunk size too large".to_string())?;
    let chunker = ChunkerConfig::with_average(avg).map_err(|e| format!("--avg-chunk-size: {e}"))?;
    Ok(Options {
        engine: EngineOptions {
            root: cli.root.clone(),
            chunker,
            workers: cli.workers.max(1),
            ..EngineOptions::default()
        },
        quiet: cli.quiet,
        verbose: cli.verbose,
        json_output: cli.json_output,
    })
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("chunksync".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        let _ = resolve_options(&cli);
    }
}

fn fail(context: &str, err: impl std::fmt::Display) -> i32 {
    eprintln!("chunksync: {context}: {err}");
    1
}

fn emit_json<T: serde::Serialize>(opts: &Options, value: &T) {
    if opts.json_output {
        match serde_json::to_string(value) {
            Ok(s) => eprintln!("{s}"),
            Err(e) => log::warn!("cannot serialise stats: {e}"),
        }
    }
}

fn open_engine(opts: &Options) -> Result<SyncEngine, i32> {
    SyncEngine::open(opts.engine.clone())
        .map_err(|e| fail(&format!("store {}", opts.engine.root.display()), e))
}

/// Logical path for a file argument: the path as given, `/`-separated.
fn logical_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn mod_time_millis(meta: &fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// Store commands
// ---------------------------------------------------------------------------

fn cmd_init_project(opts: &Options, args: &NameArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    match engine.create_project(&args.project) {
        Ok(id) => {
            if !opts.quiet {
                println!("{id}");
            }
            emit_json(opts, &serde_json::json!({ "project": args.project, "id": id }));
            0
        }
        Err(e) => fail(&args.project, e),
    }
}

fn cmd_create(opts: &Options, args: &ContainerArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let result = engine.project_id(&args.project).and_then(|p| {
        let c = engine.create_container(p, &args.container)?;
        Ok((c, engine.base_commit(p, c)?))
    });
    match result {
        Ok((id, base)) => {
            if !opts.quiet {
                match base {
                    Some(b) => println!("{id} (base commit {b})"),
                    None => println!("{id} (empty project)"),
                }
            }
            emit_json(opts, &serde_json::json!({ "container": id, "base_commit": base }));
            0
        }
        Err(e) => fail(&format!("{}/{}", args.project, args.container), e),
    }
}

fn cmd_push(opts: &Options, args: &PushArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let name = format!("{}/{}", args.target.project, args.target.container);
    let ids = engine.project_id(&args.target.project).and_then(|p| {
        let c = engine.container_id(p, &args.target.container)?;
        let change = match args.change {
            Some(change) => change,
            None => engine.next_change(p, c)?,
        };
        Ok((p, c, change))
    });
    let (project, container, change) = match ids {
        Ok(ids) => ids,
        Err(e) => return fail(&name, e),
    };

    let mut manifest = if args.no_manifest {
        FileMetadata::new()
    } else {
        let latest = change.checked_sub(1);
        let read = match latest {
            Some(prev) => engine.read_manifest(Scope::Container(project, container), prev),
            None => match engine.base_commit(project, container) {
                Ok(Some(base)) => engine.read_manifest(Scope::Commit(project), base),
                Ok(None) => Ok(FileMetadata::new()),
                Err(e) => Err(e),
            },
        };
        match read {
            Ok(m) => m,
            Err(e) => return fail("manifest", e),
        }
    };

    let mut files = Vec::with_capacity(args.files.len() + 1);
    let mut pushed = HashSet::with_capacity(args.files.len());
    for path in &args.files {
        let content = match fs::read(path) {
            Ok(c) => c,
            Err(e) => return fail(&path.display().to_string(), e),
        };
        let mod_time = fs::metadata(path).map(|m| mod_time_millis(&m)).unwrap_or(0);
        let logical = logical_path(path);
        manifest.insert(logical.clone(), FileEntry::file(&content, mod_time));
        files.push((PathHash::from_path(&logical), content));
        pushed.insert(logical);
    }
    let file_count = files.len();

    // A path both pushed and removed keeps the pushed content.
    let mut removed = Vec::with_capacity(args.remove.len());
    for path in args.remove.iter().filter(|p| !pushed.contains(p.as_str())) {
        manifest.remove(path);
        removed.push(PathHash::from_path(path));
    }
    if !args.no_manifest {
        match manifest.to_json() {
            Ok(json) => files.push((manifest_path_hash(), json)),
            Err(e) => return fail("manifest", e),
        }
    }

    // Files, removals and the manifest land in one change or not at all.
    let stats = match engine.write_change(project, container, change, &files, &removed) {
        Ok(s) => s,
        Err(e) => return fail(&name, e),
    };

    if !opts.quiet {
        eprintln!(
            "change {change}: {file_count} files, {} removed, {} data bytes, {} blocks reused",
            removed.len(),
            stats.data_bytes,
            stats.blocks
        );
    }
    emit_json(opts, &serde_json::json!({ "change": change, "ops": stats }));
    0
}

fn cmd_cat(opts: &Options, args: &CatArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let resolved = engine.project_id(&args.project).and_then(|p| match &args.container {
        Some(name) => {
            let c = engine.container_id(p, name)?;
            let change = match args.change {
                Some(change) => change,
                None => engine.current_change(p, c)?.unwrap_or(0),
            };
            Ok(Some((Scope::Container(p, c), change)))
        }
        None => {
            let commit = match args.commit {
                Some(commit) => Some(commit),
                None => engine.current_commit(p)?,
            };
            Ok(commit.map(|c| (Scope::Commit(p), c)))
        }
    });
    let (scope, version) = match resolved {
        Ok(Some(v)) => v,
        // No commit yet: every path is empty.
        Ok(None) => return 0,
        Err(e) => return fail(&args.project, e),
    };

    let path = PathHash::from_path(&args.path);
    let result = match &args.output {
        Some(out) => fs::File::create(out)
            .map_err(Into::into)
            .and_then(|f| engine.regenerate_into(scope, version, path, BufWriter::new(f))),
        None => {
            let stdout = io::stdout();
            engine.regenerate_into(scope, version, path, stdout.lock())
        }
    };
    match result {
        Ok(len) => {
            emit_json(opts, &serde_json::json!({ "path": args.path, "version": version, "bytes": len }));
            0
        }
        Err(e) => fail(&args.path, e),
    }
}

fn cmd_merge(opts: &Options, args: &ContainerArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let result = engine.project_id(&args.project).and_then(|p| {
        let c = engine.container_id(p, &args.container)?;
        engine.merge_with_stats(p, c)
    });
    match result {
        Ok(stats) => {
            if !opts.quiet {
                match stats.commit {
                    Some(commit) => println!("{commit}"),
                    None => println!("no commits"),
                }
            }
            emit_json(opts, &stats);
            0
        }
        Err(e) => fail(&format!("merge {}/{}", args.project, args.container), e),
    }
}

fn cmd_log(opts: &Options, args: &NameArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let project = match engine.project_id(&args.project) {
        Ok(p) => p,
        Err(e) => return fail(&args.project, e),
    };
    let run = || -> Result<(), crate::engine::SyncError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if let Some(current) = engine.current_commit(project)? {
            for commit in (0..=current).rev() {
                let paths = engine.location_index().paths_at(Scope::Commit(project), commit)?;
                writeln!(out, "commit {commit}: {} paths", paths.len())?;
            }
        }
        for info in engine.catalog().containers(project)? {
            let change = engine.current_change(project, info.id)?;
            let base = info.base_commit.map_or("-".to_string(), |b| b.to_string());
            let change = change.map_or("-".to_string(), |c| c.to_string());
            writeln!(
                out,
                "container {} ({}): base {base}, change {change}",
                info.name, info.id
            )?;
        }
        Ok(())
    };
    match run() {
        Ok(()) => 0,
        Err(e) => fail(&args.project, e),
    }
}

fn cmd_delete(opts: &Options, args: &DeleteArgs) -> i32 {
    let engine = match open_engine(opts) {
        Ok(e) => e,
        Err(code) => return code,
    };
    let result = engine.project_id(&args.project).and_then(|p| match &args.container {
        Some(name) => {
            let c = engine.container_id(p, name)?;
            engine.delete_container(p, c)
        }
        None => engine.delete_project(p),
    });
    match result {
        Ok(()) => 0,
        Err(e) => fail(&args.project, e),
    }
}

// ---------------------------------------------------------------------------
// File commands
// ---------------------------------------------------------------------------

fn cmd_signature(opts: &Options, args: &SignatureArgs) -> i32 {
    let chunker = Chunker::new(opts.engine.chunker);
    match crate::io::signature_file(&args.input, &args.signature, &chunker) {
        Ok(stats) => {
            if opts.verbose > 0 && !opts.quiet {
                eprintln!("{} chunks over {} bytes", stats.chunks, stats.input_size);
            }
            emit_json(opts, &stats);
            0
        }
        Err(e) => fail(&args.input.display().to_string(), e),
    }
}

fn cmd_diff(opts: &Options, args: &DiffArgs) -> i32 {
    let chunker = Chunker::new(opts.engine.chunker);
    match crate::io::diff_files(&args.source, &args.signature, &args.delta, &chunker) {
        Ok(stats) => {
            if opts.verbose > 0 && !opts.quiet {
                eprintln!(
                    "{} blocks reused, {} literal bytes, delta {} bytes",
                    stats.ops.blocks, stats.ops.data_bytes, stats.delta_size
                );
            }
            emit_json(opts, &stats);
            0
        }
        Err(e) => fail(&args.source.display().to_string(), e),
    }
}

fn cmd_apply(opts: &Options, args: &ApplyArgs) -> i32 {
    match crate::io::apply_file(&args.original, &args.delta, &args.output) {
        Ok(stats) => {
            if opts.verbose > 0 && !opts.quiet {
                eprintln!("wrote {} bytes", stats.output_size);
            }
            emit_json(opts, &stats);
            0
        }
        Err(e) => fail(&args.delta.display().to_string(), e),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let opts = match resolve_options(&cli) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("chunksync: {msg}");
            process::exit(1);
        }
    };

    let exit_code = match &cli.command {
        Cmd::InitProject(args) => cmd_init_project(&opts, args),
        Cmd::Create(args) => cmd_create(&opts, args),
        Cmd::Push(args) => cmd_push(&opts, args),
        Cmd::Cat(args) => cmd_cat(&opts, args),
        Cmd::Merge(args) => cmd_merge(&opts, args),
        Cmd::Log(args) => cmd_log(&opts, args),
        Cmd::Delete(args) => cmd_delete(&opts, args),
        Cmd::Signature(args) => cmd_signature(&opts, args),
        Cmd::Diff(args) => cmd_diff(&opts, args),
        Cmd::Apply(args) => cmd_apply(&opts, args),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
