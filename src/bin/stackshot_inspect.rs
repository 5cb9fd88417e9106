//! stackshot-inspect: Decode and check stackshot buffers
//!
//! Buffers are read from disk, inflated if compressed, and printed either as
//! an indented record tree or as JSON.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use stackshot::kcdata::types::{
    STACKSHOT_CONTAINER_PORTLABEL, STACKSHOT_CONTAINER_TASK, STACKSHOT_CONTAINER_THREAD,
    STACKSHOT_CONTAINER_TRANSITIONING_TASK,
};
use stackshot::kcdata::{parse, Snapshot};
use stackshot::records::Record;

#[derive(Parser)]
#[command(name = "stackshot-inspect")]
#[command(about = "Decode and check stackshot buffers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record in a buffer
    Dump {
        /// Path to the buffer
        input: PathBuf,

        /// Output format: tree, json
        #[arg(short, long, default_value = "tree")]
        format: String,
    },
    /// Check that a buffer decodes cleanly
    Verify {
        /// Path to the buffer
        input: PathBuf,
    },
    /// Count tasks, threads and blocking edges
    Summary {
        /// Path to the buffer
        input: PathBuf,

        /// Output format: tree, json
        #[arg(short, long, default_value = "tree")]
        format: String,
    },
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    bytes: usize,
    delta: bool,
    compressed: bool,
    tasks: usize,
    transitioning_tasks: usize,
    threads: usize,
    thread_deltas: usize,
    wait_edges: usize,
    turnstile_edges: usize,
    port_labels: usize,
    records: usize,
    duration_ticks: Option<u64>,
}

fn load(input: &Path) -> Result<(usize, Snapshot)> {
    let bytes =
        fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let snapshot = parse(&bytes)
        .with_context(|| format!("{} is not a valid stackshot buffer", input.display()))?;
    Ok((bytes.len(), snapshot))
}

fn summarize(bytes: usize, snapshot: &Snapshot) -> Summary {
    let mut summary = Summary {
        bytes,
        delta: snapshot.delta,
        compressed: snapshot.compressed,
        tasks: snapshot.containers(STACKSHOT_CONTAINER_TASK).len(),
        transitioning_tasks: snapshot
            .containers(STACKSHOT_CONTAINER_TRANSITIONING_TASK)
            .len(),
        threads: snapshot.containers(STACKSHOT_CONTAINER_THREAD).len(),
        port_labels: snapshot.containers(STACKSHOT_CONTAINER_PORTLABEL).len(),
        ..Default::default()
    };
    for rec in snapshot.all_records() {
        summary.records += 1;
        match rec {
            Record::ThreadDeltaSnapshots(v) => summary.thread_deltas += v.len(),
            Record::WaitInfo(v) => summary.wait_edges += v.len(),
            Record::TurnstileInfo(v) => summary.turnstile_edges += v.len(),
            Record::Duration(d) => summary.duration_ticks = Some(d.duration),
            _ => {}
        }
    }
    summary
}

fn print_summary(summary: &Summary) {
    let kind = if summary.delta { "delta stackshot" } else { "stackshot" };
    let packing = if summary.compressed { ", compressed" } else { "" };
    println!("{} ({} bytes{})", kind, summary.bytes, packing);
    println!("  tasks:               {}", summary.tasks);
    println!("  transitioning tasks: {}", summary.transitioning_tasks);
    println!("  threads:             {}", summary.threads);
    println!("  thread deltas:       {}", summary.thread_deltas);
    println!("  wait edges:          {}", summary.wait_edges);
    println!("  turnstile edges:     {}", summary.turnstile_edges);
    println!("  port labels:         {}", summary.port_labels);
    println!("  records:             {}", summary.records);
    if let Some(ticks) = summary.duration_ticks {
        println!("  duration:            {} ticks", ticks);
    }
}

fn run_dump(input: PathBuf, format: String) -> Result<()> {
    let (_, snapshot) = load(&input)?;
    match format.as_str() {
        "tree" => print!("{}", snapshot.render_tree()),
        "json" => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        other => bail!("Unknown format: {}. Use tree or json", other),
    }
    Ok(())
}

fn run_verify(input: PathBuf) -> Result<()> {
    let (bytes, snapshot) = load(&input)?;
    println!(
        "ok: {} bytes, {} tasks, {} threads",
        bytes,
        snapshot.containers(STACKSHOT_CONTAINER_TASK).len(),
        snapshot.containers(STACKSHOT_CONTAINER_THREAD).len()
    );
    Ok(())
}

fn run_summary(input: PathBuf, format: String) -> Result<()> {
    let (bytes, snapshot) = load(&input)?;
    let summary = summarize(bytes, &snapshot);
    match format.as_str() {
        "tree" => print_summary(&summary),
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        other => bail!("Unknown format: {}. Use tree or json", other),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Dump { input, format } => run_dump(input, format),
        Commands::Verify { input } => run_verify(input),
        Commands::Summary { input, format } => run_summary(input, format),
    }
}
