//! Tempora - command-line access to a tuple archive
//!
//! Usage:
//!   tempora --root data put tuples.jsonl
//!   tempora --root data fetch http://example.org/sensor1 --property http://example.org/temp --limit 10
//!   tempora --root data fetch http://example.org/sensor1 --begin 1700000000 --interval 3600 --op avg
//!   tempora --config archive.json properties http://example.org/sensor1

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tempora::core::json::{format_tuple, parse_tuple};
use tempora::{Archive, ArchiveConfig, Error, Result, Tuple};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tempora", version)]
#[command(about = "Tempora - partitioned archive for time-stamped item/property/context tuples")]
struct Cli {
    /// Archive root directory (overrides the config file)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store tuples read from a JSON-lines file ("-" reads stdin)
    Put {
        file: PathBuf,

        /// Tuples per committed batch
        #[arg(long, default_value = "100000")]
        batch_size: usize,
    },
    /// Print the tuples of an item as JSON lines
    Fetch {
        item: String,

        #[arg(long)]
        property: Option<String>,

        #[arg(long)]
        context: Option<String>,

        /// Rows (or aggregates) per property, 0 = unlimited
        #[arg(long, default_value = "0")]
        limit: usize,

        /// Inclusive lower time bound, 0 = open
        #[arg(long, default_value = "0")]
        begin: i64,

        /// Exclusive upper time bound, 0 = open
        #[arg(long, default_value = "0")]
        end: i64,

        /// Bucket width in seconds for --op, 0 = one bucket
        #[arg(long, default_value = "0")]
        interval: i64,

        /// Aggregation: avg, sum, min, max, count, first or last
        #[arg(long)]
        op: Option<String>,
    },
    /// List the properties recorded for an item
    Properties { item: String },
}

fn load_config(cli: &Cli) -> Result<ArchiveConfig> {
    let mut config = match &cli.config {
        Some(path) => ArchiveConfig::from_json_file(path)?,
        None => ArchiveConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    Ok(config)
}

fn put(archive: &Archive, file: &Path, batch_size: usize) -> Result<()> {
    let input: Box<dyn BufRead> = if file.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(file)?))
    };

    let mut batch: Vec<Tuple> = Vec::with_capacity(batch_size.min(100_000));
    let mut total = 0u64;
    for (number, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let tuple = parse_tuple(&line)
            .map_err(|e| Error::InvalidArgument(format!("line {}: {}", number + 1, e)))?;
        batch.push(tuple);
        if batch.len() >= batch_size.max(1) {
            total += archive.put(std::mem::take(&mut batch))?.tuples;
        }
    }
    total += archive.put(batch)?.tuples;
    info!(tuples = total, "import finished");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let archive = Archive::open(config)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match cli.command {
        Command::Put { file, batch_size } => put(&archive, &file, batch_size)?,
        Command::Fetch { item, property, context, limit, begin, end, interval, op } => {
            let tuples = archive.fetch_range(
                &item,
                property.as_deref(),
                context.as_deref(),
                end,
                begin,
                limit,
                interval,
                op.as_deref(),
            )?;
            for tuple in tuples {
                writeln!(out, "{}", format_tuple(&tuple?)?)?;
            }
        }
        Command::Properties { item } => {
            for property in archive.properties(&item)? {
                writeln!(out, "{}", property?)?;
            }
        }
    }
    out.flush()?;
    archive.close()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
