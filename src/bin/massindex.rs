use clap::{Parser, Subcommand};
use massindex::{
    MassIndex, MassIndexBuilder, MassIndexError, MassIndexMerger, MassIndexReader, Result,
    TsvEntries,
};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, IsTerminal, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Build(args) => run_build(args),
        Command::Lookup(args) => run_lookup(args),
        Command::Info(args) => run_info(args),
        Command::Dump(args) => run_dump(args),
        Command::Get(args) => run_get(args),
        Command::Merge(args) => run_merge(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "massindex utility for building, querying and inspecting massindex files",
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a massindex file from tab separated `key<TAB>value` lines
    Build(BuildArgs),
    /// Print the first value of each key read from a file or stdin
    Lookup(LookupArgs),
    /// Inspect a massindex file and print basic information as JSON
    Info(StoreArgs),
    /// Print every `key<TAB>value` pair in key order
    Dump(StoreArgs),
    /// Print every value of one key
    Get(GetArgs),
    /// Merge several massindex files into one
    Merge(MergeArgs),
}

#[derive(clap::Args)]
struct BuildArgs {
    /// Path to the TSV input, or `-` for stdin
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Path to the massindex file to produce
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Writer buffer size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 << 20)]
    buffer_size: usize,

    /// Number of key-hash shards grouped in parallel
    #[arg(long, value_name = "COUNT", default_value_t = 1)]
    shards: usize,

    /// Field separator (a single byte)
    #[arg(long, value_name = "CHAR", default_value_t = '\t')]
    separator: char,

    /// Abort when the share of malformed lines exceeds this ratio
    #[arg(long, value_name = "RATIO")]
    max_error_ratio: Option<f64>,

    /// Directory for sorted runs when the input exceeds the spill threshold
    #[arg(long, value_name = "DIR")]
    spill_dir: Option<PathBuf>,

    /// Buffered bytes that trigger a spill to --spill-dir
    #[arg(long, value_name = "BYTES", default_value_t = 256 << 20)]
    spill_threshold: usize,
}

#[derive(clap::Args)]
struct LookupArgs {
    /// Path to the massindex file
    #[arg(value_name = "STORE")]
    store: PathBuf,

    /// File of newline separated keys; stdin when omitted
    #[arg(value_name = "KEYS")]
    keys: Option<PathBuf>,

    /// Do not print values
    #[arg(short, long)]
    quiet: bool,

    /// Report elapsed time and hit counts on stderr
    #[arg(short, long)]
    time: bool,

    /// Run the key list this many times
    #[arg(long, value_name = "N", default_value_t = 1)]
    repeat: usize,

    /// Split lookups across this many threads (implies --quiet when > 1)
    #[arg(long, value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Read through a memory map instead of positional file reads
    #[arg(long)]
    mmap: bool,

    /// Print an empty line for absent keys and empty groups
    #[arg(long)]
    print_missing: bool,
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Path to the massindex file
    #[arg(value_name = "STORE")]
    store: PathBuf,
}

#[derive(clap::Args)]
struct GetArgs {
    /// Path to the massindex file
    #[arg(value_name = "STORE")]
    store: PathBuf,

    /// Key to look up
    #[arg(value_name = "KEY")]
    key: String,
}

#[derive(clap::Args)]
struct MergeArgs {
    /// Path to the merged massindex file to produce
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Input massindex files, merged in order
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Writer buffer size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = 16 << 20)]
    buffer_size: usize,
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(std::io::stdin().lock()))
    } else {
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }
}

/// Writes `output` through a temporary file in the same directory, renamed
/// into place only when `f` succeeds.
fn write_output<T>(output: &Path, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    let value = f(temp.as_file())?;
    temp.persist(output).map_err(|e| e.error)?;
    Ok(value)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::other(format!("Failed to format JSON: {e}")))?;
    println!("{}", json);
    Ok(())
}

fn run_build(args: BuildArgs) -> Result<()> {
    if !args.separator.is_ascii() {
        return Err(MassIndexError::InvalidInput(format!(
            "separator {:?} is not an ASCII character",
            args.separator
        )));
    }
    let mut entries =
        TsvEntries::new(open_input(&args.input)?).with_separator(args.separator as u8);
    if let Some(ratio) = args.max_error_ratio {
        entries = entries.with_max_error_ratio(ratio);
    }

    let mut builder = MassIndexBuilder::default()
        .with_writer_buffer_size(args.buffer_size)
        .with_shard_count(args.shards);
    if let Some(dir) = args.spill_dir {
        builder = builder
            .with_spill_dir(dir)
            .with_spill_threshold(args.spill_threshold);
    }
    for entry in entries.by_ref() {
        let (key, value) = entry?;
        builder.add(key, value);
    }
    if entries.skipped_lines() > 0 {
        eprintln!(
            "skipped {} of {} lines without separator",
            entries.skipped_lines(),
            entries.total_lines()
        );
    }

    write_output(&args.output, |file| builder.finalize(file))?;
    Ok(())
}

/// Reads the next key line into `line`, without its line ending.
fn next_key<'a>(input: &mut impl BufRead, line: &'a mut Vec<u8>) -> Result<Option<&'a [u8]>> {
    line.clear();
    if input.read_until(b'\n', line)? == 0 {
        return Ok(None);
    }
    let mut key = line.as_slice();
    if let Some(rest) = key.strip_suffix(b"\n") {
        key = rest.strip_suffix(b"\r").unwrap_or(rest);
    }
    Ok(Some(key))
}

#[derive(Default)]
struct LookupStats {
    hits: u64,
    misses: u64,
}

#[derive(Clone, Copy)]
struct LookupOutput {
    quiet: bool,
    print_missing: bool,
}

/// Writes the first value of the group of `key`, or nothing for an absent key
/// or an empty group unless `print_missing` asks for an empty line.
fn lookup_key<R: MassIndexReader>(
    index: &MassIndex<R>,
    key: &[u8],
    out: &mut impl Write,
    output: LookupOutput,
    stats: &mut LookupStats,
) -> Result<()> {
    let value = match index.get(key) {
        Some(values) => values.first()?,
        None => None,
    };
    match value {
        Some(value) => {
            stats.hits += 1;
            if !output.quiet {
                out.write_all(&value)?;
                out.write_all(b"\n")?;
            }
        }
        None => {
            stats.misses += 1;
            if !output.quiet && output.print_missing {
                out.write_all(b"\n")?;
            }
        }
    }
    Ok(())
}

/// Streams key lines from `input` through [`lookup_key`].
fn lookup_lines<R: MassIndexReader>(
    index: &MassIndex<R>,
    mut input: impl BufRead,
    out: &mut impl Write,
    output: LookupOutput,
) -> Result<LookupStats> {
    let mut stats = LookupStats::default();
    let mut line = Vec::new();
    while let Some(key) = next_key(&mut input, &mut line)? {
        lookup_key(index, key, out, output, &mut stats)?;
    }
    out.flush()?;
    Ok(stats)
}

fn run_lookup(args: LookupArgs) -> Result<()> {
    let input: Box<dyn BufRead> = match &args.keys {
        Some(path) => open_input(path)?,
        None => Box::new(std::io::stdin().lock()),
    };
    if args.mmap {
        lookup_with(MassIndex::open_mmap(&args.store)?, input, &args)
    } else {
        lookup_with(MassIndex::open(&args.store)?, input, &args)
    }
}

fn lookup_with<R>(
    index: MassIndex<R>,
    mut input: Box<dyn BufRead>,
    args: &LookupArgs,
) -> Result<()>
where
    R: MassIndexReader + Sync,
{
    let start = Instant::now();
    let threads = args.threads.max(1);
    let output = LookupOutput {
        quiet: args.quiet,
        print_missing: args.print_missing,
    };

    let stats = if threads == 1 && args.repeat <= 1 {
        let stdout = std::io::stdout().lock();
        if args.keys.is_none() && std::io::stdin().is_terminal() {
            lookup_lines(&index, input, &mut LineWriter::new(stdout), output)?
        } else {
            lookup_lines(&index, input, &mut BufWriter::new(stdout), output)?
        }
    } else {
        let mut keys = Vec::new();
        let mut line = Vec::new();
        while let Some(key) = next_key(&mut input, &mut line)? {
            keys.push(key.to_vec());
        }
        if threads == 1 {
            let mut out = BufWriter::new(std::io::stdout().lock());
            let mut stats = LookupStats::default();
            for _ in 0..args.repeat {
                for key in &keys {
                    lookup_key(&index, key, &mut out, output, &mut stats)?;
                }
            }
            out.flush()?;
            stats
        } else {
            lookup_parallel(&index, &keys, threads, args.repeat)?
        }
    };

    if args.time {
        let elapsed = start.elapsed();
        let lookups = stats.hits + stats.misses;
        eprintln!(
            "{} lookups ({} hits, {} misses) in {:.3}s, {:.0} lookups/s",
            lookups,
            stats.hits,
            stats.misses,
            elapsed.as_secs_f64(),
            lookups as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }
    Ok(())
}

/// Counts hits and misses across `threads` scoped threads without printing.
fn lookup_parallel<R>(
    index: &MassIndex<R>,
    keys: &[Vec<u8>],
    threads: usize,
    repeat: usize,
) -> Result<LookupStats>
where
    R: MassIndexReader + Sync,
{
    let chunk = keys.len().div_ceil(threads).max(1);
    let output = LookupOutput {
        quiet: true,
        print_missing: false,
    };
    let partial = std::thread::scope(|scope| {
        let handles: Vec<_> = keys
            .chunks(chunk)
            .map(|part| {
                scope.spawn(move || -> Result<LookupStats> {
                    let mut stats = LookupStats::default();
                    let mut sink = std::io::sink();
                    for _ in 0..repeat {
                        for key in part {
                            lookup_key(index, key, &mut sink, output, &mut stats)?;
                        }
                    }
                    Ok(stats)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(std::io::Error::other("lookup thread panicked").into())
                })
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut stats = LookupStats::default();
    for part in partial {
        stats.hits += part.hits;
        stats.misses += part.misses;
    }
    Ok(stats)
}

fn run_info(args: StoreArgs) -> Result<()> {
    let index = MassIndex::open(&args.store)?;
    print_json(&index.info())
}

fn run_dump(args: StoreArgs) -> Result<()> {
    let index = MassIndex::open(&args.store)?;
    let mut out = BufWriter::new(std::io::stdout().lock());
    for (key, values) in index.iter() {
        for value in values.iter() {
            out.write_all(key)?;
            out.write_all(b"\t")?;
            out.write_all(&value?)?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn run_get(args: GetArgs) -> Result<()> {
    let index = MassIndex::open(&args.store)?;
    let mut out = BufWriter::new(std::io::stdout().lock());
    if let Some(values) = index.get(args.key.as_bytes()) {
        for value in values.iter() {
            out.write_all(&value?)?;
            out.write_all(b"\n")?;
        }
    }
    out.flush()?;
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let indexes = args
        .inputs
        .iter()
        .map(|path| MassIndex::open(path))
        .collect::<Result<Vec<_>>>()?;
    let info = write_output(&args.output, |file| {
        MassIndexMerger::default()
            .with_writer_buffer_size(args.buffer_size)
            .merge(file, &indexes)
    })?;
    print_json(&info)
}
