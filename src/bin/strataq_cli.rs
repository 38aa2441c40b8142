use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use strataq::qindex::journal::Journal;
use strataq::qindex::segment as qseg;
use strataq::store::index::SNAPSHOT_FILE;
use strataq::store::segment as sseg;
use strataq::store::CLEAN_META_FILE;

#[derive(Parser)]
#[command(name = "strataq-cli", version, about = "Queue engine on-disk tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect one queue directory: index segments and journal.
    Queue { queue_path: PathBuf },
    /// Inspect a message store directory: segments and markers.
    Store { store_path: PathBuf },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());

    match cli.command {
        Commands::Queue { queue_path } => {
            let segments = qseg::discover_segments(&queue_path)
                .with_context(|| format!("reading {}", queue_path.display()))?;
            writeln!(out, "queue {}", queue_path.display())?;
            writeln!(out, "  index segments: {}", segments.len())?;
            let mut live_total = 0u64;
            for id in segments {
                let entries = qseg::load_segment(&qseg::segment_path(&queue_path, id))?;
                let pubs = entries.values().filter(|e| e.publish.is_some()).count();
                let acked = entries
                    .values()
                    .filter(|e| e.publish.is_some() && e.acked)
                    .count();
                let live = pubs - acked;
                live_total += live as u64;
                writeln!(
                    out,
                    "  {}  publishes={pubs} acked={acked} live={live}",
                    qseg::segment_filename(id)
                )?;
            }
            let journal = Journal::replay(&queue_path)?;
            writeln!(out, "  journal records: {}", journal.len())?;
            writeln!(out, "  live entries in segments: {live_total}")?;
        }
        Commands::Store { store_path } => {
            let segments = sseg::discover_segments(&store_path)
                .with_context(|| format!("reading {}", store_path.display()))?;
            writeln!(out, "store {}", store_path.display())?;
            for id in segments {
                let path = sseg::segment_path(&store_path, id);
                let total = std::fs::metadata(&path)?.len();
                let mut records = 0u64;
                let valid = sseg::scan_segment(&path, |_| records += 1)?;
                writeln!(
                    out,
                    "  {}  records={records} valid_bytes={valid} file_bytes={total}",
                    sseg::segment_filename(id)
                )?;
            }
            let snapshot = store_path.join(SNAPSHOT_FILE).exists();
            let clean = store_path.join(CLEAN_META_FILE).exists();
            writeln!(
                out,
                "  snapshot: {}  clean marker: {}",
                if snapshot { "present" } else { "absent" },
                if clean { "present" } else { "absent" }
            )?;
            if !snapshot || !clean {
                writeln!(out, "  (next open will rescan segment files)")?;
            }
        }
    }
    out.flush()?;
    Ok(())
}
