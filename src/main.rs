//! stackshot: capture a point-in-time snapshot of every task and thread
//!
//! The system being captured comes from a scenario file, a seeded synthetic
//! generator, or the live host. The result is printed as JSON and the
//! buffer is written to `--output`.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stackshot::host;
use stackshot::sim::{synthetic, Scenario, SimKernel};
use stackshot::{
    Origin, SnapshotRequest, StackshotFlags, StackshotResult, StackshotService, Status, Tunables,
};

#[derive(Debug, Parser)]
#[command(name = "stackshot")]
#[command(about = "Capture a point-in-time snapshot of every task and thread")]
#[command(version)]
struct Command {
    #[arg(short, long)]
    verbose: bool,
    /// JSON scenario describing the system to capture
    #[arg(long, conflicts_with_all = ["synthetic", "host"])]
    scenario: Option<PathBuf>,
    /// Generate a system with this many user tasks
    #[arg(long, conflicts_with = "host")]
    synthetic: Option<usize>,
    #[arg(long, default_value = "0")]
    seed: u64,
    /// Capture the processes of this machine
    #[arg(long)]
    host: bool,
    /// Keep at most this many host processes
    #[arg(long)]
    host_limit: Option<usize>,
    /// Write the scenario as JSON and exit without capturing
    #[arg(long)]
    save_scenario: Option<PathBuf>,
    /// Tunables file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where to write the buffer
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(short, long, default_value = "-1", allow_negative_numbers = true)]
    pid: i32,
    /// Only report what changed after this timestamp
    #[arg(long)]
    delta_since: Option<u64>,
    #[arg(long)]
    compress: bool,
    #[arg(long)]
    fault_backtraces: bool,
    #[arg(long)]
    fault_uuids: bool,
    #[arg(long)]
    loadinfo: bool,
    #[arg(long)]
    kext_loadinfo: bool,
    #[arg(long)]
    mem_stats: bool,
    #[arg(long)]
    dispatch_queues: bool,
    #[arg(long)]
    shared_cache: bool,
    #[arg(long)]
    kernel_threads_only: bool,
    #[arg(long)]
    thread_groups: bool,
    #[arg(long)]
    coalitions: bool,
    #[arg(long)]
    io_stats: bool,
    #[arg(long)]
    instrs_cycles: bool,
    #[arg(long)]
    page_tables: bool,
    #[arg(long, default_value = "0")]
    pagetable_mask: u32,
    /// Fail instead of waiting if a capture is already running
    #[arg(long)]
    trylock: bool,
    /// Capture into a retained buffer, then retrieve it
    #[arg(long)]
    retain: bool,
    #[arg(long, default_value = "0")]
    size_hint: u64,
    /// Capture once into a buffer of exactly this many bytes
    #[arg(long, conflicts_with_all = ["retain", "trylock"])]
    fixed_size: Option<usize>,
}

impl Command {
    fn flags(&self) -> StackshotFlags {
        let mut flags = StackshotFlags::default();
        flags.set_delta(self.delta_since.is_some());
        flags.set_compress(self.compress);
        flags.set_fault_backtraces(self.fault_backtraces);
        flags.set_fault_uuids(self.fault_uuids);
        flags.set_save_loadinfo(self.loadinfo);
        flags.set_save_kext_loadinfo(self.kext_loadinfo);
        flags.set_global_mem_stats(self.mem_stats);
        flags.set_get_dispatch_queue(self.dispatch_queues);
        flags.set_shared_cache_layout(self.shared_cache);
        flags.set_active_kernel_threads_only(self.kernel_threads_only);
        flags.set_thread_groups(self.thread_groups);
        flags.set_jetsam_coalitions(self.coalitions);
        flags.set_io_stats(self.io_stats);
        flags.set_instrs_cycles(self.instrs_cycles);
        flags.set_page_tables(self.page_tables);
        flags.set_trylock(self.trylock);
        flags
    }

    fn request(&self) -> SnapshotRequest {
        let mut req = SnapshotRequest {
            pid: self.pid,
            flags: self.flags(),
            since_timestamp: self.delta_since.unwrap_or(0),
            pagetable_mask: self.pagetable_mask,
            size_hint: self.size_hint,
            ..Default::default()
        };
        // Only kernel callers may retain buffers or skip waiting for the lock.
        if self.retain || self.trylock {
            req.origin = Origin::Kernel;
            req.flags.set_save_in_kernel_buffer(true);
        }
        req
    }

    fn scenario(&self) -> Result<Scenario> {
        if let Some(path) = &self.scenario {
            Scenario::from_file(path)
        } else if let Some(tasks) = self.synthetic {
            Ok(synthetic::generate(tasks, self.seed))
        } else if self.host {
            host::scenario(self.host_limit).context("failed to describe the host")
        } else {
            bail!("one of --scenario, --synthetic or --host is required")
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn run(opts: &Command) -> Result<StackshotResult> {
    let tunables = match &opts.config {
        Some(path) => Tunables::from_file(path)?,
        None => Tunables::default(),
    };
    let scenario = opts.scenario()?;
    let kernel = SimKernel::from_scenario(&scenario).context("failed to build the system")?;
    info!(
        "capturing {} tasks with {} threads",
        scenario.tasks.len(),
        scenario.thread_count()
    );
    let service = StackshotService::new(kernel, tunables);
    let req = opts.request();

    if let Some(size) = opts.fixed_size {
        return Ok(service.capture_fixed(req, size));
    }
    let result = service.stack_snapshot(req);
    if !result.status.is_success() || result.buffer.is_some() {
        return Ok(result);
    }

    let mut retrieve = StackshotFlags::default();
    retrieve.set_retrieve_existing_buffer(true);
    Ok(service.stack_snapshot(SnapshotRequest {
        flags: retrieve,
        origin: Origin::Kernel,
        ..Default::default()
    }))
}

fn main() -> Result<()> {
    let opts = Command::parse();
    init_logging(opts.verbose);

    if let Some(path) = &opts.save_scenario {
        opts.scenario()?.save(path)?;
        return Ok(());
    }

    let result = run(&opts)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if result.status != Status::Success {
        bail!("stackshot failed: {}", result.status);
    }
    if let (Some(path), Some(buffer)) = (&opts.output, &result.buffer) {
        fs::write(path, buffer)
            .with_context(|| format!("failed to write buffer to {}", path.display()))?;
        info!("wrote {} bytes to {}", buffer.len(), path.display());
    }
    Ok(())
}
