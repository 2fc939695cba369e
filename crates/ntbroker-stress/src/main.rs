// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use ntbroker_core::{
    AccessMode, AsyncStatus, Broker, BrokerError, FileObject, LockKind, OpenOptions, ProcessId,
    QueueKind, ShareMode,
};
use ntbroker_logging::CliLoggingArgs;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("ntbroker-stress")?;

    match cli.command {
        Command::Open(args) => {
            let json_output = args.json_output.clone();
            let report = run_open_workload(args)?;
            emit_report(&report, json_output.as_deref())?;
        }
        Command::Async(args) => {
            let json_output = args.json_output.clone();
            let report = run_async_workload(args)?;
            emit_report(&report, json_output.as_deref())?;
        }
    }
    Ok(())
}

fn emit_report<T: Serialize>(report: &T, json_output: Option<&std::path::Path>) -> Result<()> {
    if let Some(path) = json_output {
        serde_json::to_writer_pretty(File::create(path)?, report)?;
    }
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(report)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "NT broker stress workload runner")]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mixed open/share/lock workload against a working directory
    Open(OpenArgs),
    /// Pending-I/O workload driving the readiness loop over pipe pairs
    Async(AsyncArgs),
}

#[derive(Args, Clone)]
struct OpenArgs {
    /// Working directory for workload files (default: a fresh temp dir)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Number of distinct files in the working set
    #[arg(long, default_value_t = 32)]
    files: usize,

    /// Number of workload iterations
    #[arg(long, default_value_t = 10_000)]
    iterations: u64,

    /// RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct AsyncArgs {
    /// Number of pipe pairs to drive
    #[arg(long, default_value_t = 64)]
    pipes: usize,

    /// Fraction of requests that are satisfied before their timeout
    #[arg(long, default_value_t = 0.5)]
    ready_ratio: f64,

    /// RNG seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Serialize, Default)]
struct OpenReport {
    started_at: String,
    seed: u64,
    iterations: u64,
    opens: u64,
    open_failures: u64,
    sharing_violations: u64,
    closes: u64,
    locks_granted: u64,
    lock_conflicts: u64,
    unlocks: u64,
    delete_on_close: u64,
    elapsed_ms: u128,
}

struct OpenHandle {
    object: Arc<FileObject>,
    /// (owner, start, count) of logical locks taken through this handle.
    locks: Vec<(ProcessId, u64, u64)>,
}

fn random_opts(rng: &mut SmallRng) -> OpenOptions {
    let access = if rng.gen_bool(0.5) {
        AccessMode::read_write()
    } else {
        AccessMode::read_only()
    };
    let mut share = Vec::new();
    if rng.gen_bool(0.8) {
        share.push(ShareMode::Read);
    }
    if rng.gen_bool(0.6) {
        share.push(ShareMode::Write);
    }
    if rng.gen_bool(0.4) {
        share.push(ShareMode::Delete);
    }
    OpenOptions {
        access,
        share,
        create: true,
        truncate: false,
        directory: false,
        non_directory: true,
        delete_on_close: false,
    }
}

fn run_open_workload(args: OpenArgs) -> Result<OpenReport> {
    let started = Instant::now();
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = SmallRng::seed_from_u64(seed);

    let tempdir;
    let workdir = match &args.workdir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.clone()
        }
        None => {
            tempdir = tempfile::tempdir().context("creating workload directory")?;
            tempdir.path().to_path_buf()
        }
    };
    info!(workdir = %workdir.display(), seed, "starting open/lock workload");

    let broker = Broker::new(Default::default())?;
    let mut report = OpenReport {
        started_at: chrono::Utc::now().to_rfc3339(),
        seed,
        iterations: args.iterations,
        ..Default::default()
    };
    let mut handles: Vec<OpenHandle> = Vec::new();

    for iteration in 0..args.iterations {
        match rng.gen_range(0..100) {
            // Open a random file with random access/share flags.
            0..=39 => {
                let path = workdir.join(format!("file-{:03}", rng.gen_range(0..args.files)));
                match FileObject::open(&broker, &path, &random_opts(&mut rng)) {
                    Ok(object) => {
                        report.opens += 1;
                        handles.push(OpenHandle {
                            object,
                            locks: Vec::new(),
                        });
                    }
                    Err(BrokerError::SharingViolation) => report.sharing_violations += 1,
                    Err(err) => {
                        debug!(iteration, %err, "open failed");
                        report.open_failures += 1;
                    }
                }
            }
            // Close a random handle; its locks go with it.
            40..=59 if !handles.is_empty() => {
                let victim = rng.gen_range(0..handles.len());
                handles.swap_remove(victim);
                report.closes += 1;
            }
            // Take a byte-range lock through a random handle.
            60..=79 if !handles.is_empty() => {
                let pick = rng.gen_range(0..handles.len());
                let handle = &mut handles[pick];
                let Ok(fd) = handle.object.fd() else {
                    continue;
                };
                let owner = ProcessId::new(rng.gen_range(1..5));
                let start = rng.gen_range(0..1024u64) * 16;
                let count = rng.gen_range(1..64u64);
                let kind = if rng.gen_bool(0.3) {
                    LockKind::Shared
                } else {
                    LockKind::Exclusive
                };
                match fd.lock(owner, start, count, kind, false) {
                    Ok(None) => {
                        report.locks_granted += 1;
                        handle.locks.push((owner, start, count));
                    }
                    Ok(Some(_)) => unreachable!("no-wait lock returned a waitable"),
                    Err(BrokerError::LockConflict) => report.lock_conflicts += 1,
                    Err(err) => debug!(iteration, %err, "lock failed"),
                }
            }
            // Release one of this run's own locks.
            80..=89 if !handles.is_empty() => {
                let pick = rng.gen_range(0..handles.len());
                let handle = &mut handles[pick];
                if handle.locks.is_empty() {
                    continue;
                }
                let pick = rng.gen_range(0..handle.locks.len());
                let (_, start, count) = handle.locks.swap_remove(pick);
                if let Ok(fd) = handle.object.fd() {
                    fd.unlock(start, count)?;
                    report.unlocks += 1;
                }
            }
            // Create a throwaway file with delete-on-close and release it.
            _ => {
                let path = workdir.join(format!("victim-{}", iteration));
                let mut opts = random_opts(&mut rng);
                opts.access = AccessMode::read_write();
                opts.delete_on_close = true;
                if let Ok(object) = FileObject::open(&broker, &path, &opts) {
                    drop(object);
                    anyhow::ensure!(!path.exists(), "delete-on-close left {:?}", path);
                    report.delete_on_close += 1;
                }
            }
        }
    }

    handles.clear();
    report.elapsed_ms = started.elapsed().as_millis();
    info!(
        opens = report.opens,
        sharing_violations = report.sharing_violations,
        locks_granted = report.locks_granted,
        lock_conflicts = report.lock_conflicts,
        "open/lock workload complete"
    );
    Ok(report)
}

#[derive(Serialize, Default)]
struct AsyncReport {
    started_at: String,
    seed: u64,
    pipes: usize,
    ready: u64,
    timed_out: u64,
    loop_iterations: u64,
    elapsed_ms: u128,
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    anyhow::ensure!(rc == 0, "pipe creation failed: {}", io::Error::last_os_error());
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

fn run_async_workload(args: AsyncArgs) -> Result<AsyncReport> {
    let started = Instant::now();
    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = SmallRng::seed_from_u64(seed);
    info!(pipes = args.pipes, seed, "starting async workload");

    let broker = Broker::new(Default::default())?;
    let mut report = AsyncReport {
        started_at: chrono::Utc::now().to_rfc3339(),
        seed,
        pipes: args.pipes,
        ..Default::default()
    };

    let ready = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicUsize::new(0));
    let mut keep_alive = Vec::new();
    let mut expected_ready = 0u64;

    for _ in 0..args.pipes {
        let (read_end, write_end) = make_pipe()?;
        let object = FileObject::anonymous(&broker, read_end)?;
        let fd = object.fd()?;

        let ready = Arc::clone(&ready);
        let timed_out = Arc::clone(&timed_out);
        let timeout = Duration::from_millis(rng.gen_range(100..400));
        fd.queue_async(
            QueueKind::Read,
            Box::new(move |status| match status {
                AsyncStatus::Ready => {
                    ready.fetch_add(1, Ordering::SeqCst);
                }
                AsyncStatus::TimedOut => {
                    timed_out.fetch_add(1, Ordering::SeqCst);
                }
                status => panic!("unexpected completion status {:?}", status),
            }),
            Some(timeout),
        )?;

        let mut write_end = File::from(write_end);
        if rng.gen_bool(args.ready_ratio) {
            write_end.write_all(b"x")?;
            expected_ready += 1;
        }
        keep_alive.push((object, write_end));
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while ready.load(Ordering::SeqCst) + timed_out.load(Ordering::SeqCst) < args.pipes {
        anyhow::ensure!(Instant::now() < deadline, "workload stalled");
        broker.run_once(Some(Duration::from_millis(100)))?;
        report.loop_iterations += 1;
    }

    report.ready = ready.load(Ordering::SeqCst) as u64;
    report.timed_out = timed_out.load(Ordering::SeqCst) as u64;
    report.elapsed_ms = started.elapsed().as_millis();
    anyhow::ensure!(
        report.ready == expected_ready,
        "expected {} ready completions, saw {}",
        expected_ready,
        report.ready
    );
    info!(
        ready = report.ready,
        timed_out = report.timed_out,
        "async workload complete"
    );
    Ok(report)
}
