//! Staged scan pipeline.
//!
//! ```text
//! walker ──▶ classify ×N ──▶ extract ×N ──▶ probe ×N ──▶ reports
//! ```
//!
//! Stages are joined by bounded `sync_channel`s (capacity `2 × workers`), so a
//! slow probe stage pushes back on the walker instead of buffering the tree.
//! Each pool shares one receiver behind a mutex. On cancellation the walker
//! stops, and the downstream stages keep draining their queues, turning any
//! accepted binary into a `Cancelled` report instead of doing the work.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use fipscheck_contracts::{DELEGATED_CRYPTO_EXPERIMENT, FIPSCHECK_REPORT_SCHEMA_VERSION};
use tracing::{debug, info, warn};

use crate::buildinfo::{self, BuildMetadata};
use crate::cancel::CancelToken;
use crate::classify::{classify, Classification, GoBinary};
use crate::config::ScanConfig;
use crate::digest::sha256_file;
use crate::error::{ItemError, ScanError};
use crate::host::HostCapability;
use crate::probe::{probe_runtime, ProbeExit, ProbeOptions, RuntimeOutcome};
use crate::report::{BinaryKind, BinaryReport, ScanResult, ScanStats};
use crate::verdict::{aggregate, evaluate};
use crate::walk::{walk, Candidate, WalkOptions};

struct Extracted {
    binary: Box<GoBinary>,
    metadata: std::result::Result<BuildMetadata, ItemError>,
    sha256: Option<String>,
}

#[derive(Default)]
struct Counters {
    other_executables: AtomicUsize,
    unreadable_candidates: AtomicUsize,
    in_flight_probes: AtomicUsize,
    peak_probes: AtomicUsize,
    saw_cancel: AtomicBool,
}

struct Shared<'a> {
    cfg: &'a ScanConfig,
    host: &'a HostCapability,
    cancel: &'a CancelToken,
    probe: ProbeOptions,
    counters: Counters,
    reports: Mutex<Vec<BinaryReport>>,
}

pub fn run_scan(
    root: &Path,
    cfg: &ScanConfig,
    host: &HostCapability,
    cancel: &CancelToken,
) -> std::result::Result<ScanResult, ScanError> {
    cfg.validate().map_err(ScanError::InvalidConfig)?;
    check_root(root)?;

    let started = Instant::now();
    let cancel = match cfg.deadline() {
        Some(d) => cancel.with_deadline(d),
        None => cancel.clone(),
    };
    let workers = cfg.workers;
    let capacity = workers.saturating_mul(2);
    let walk_opts = WalkOptions::for_root(root, &cfg.prune, cfg.follow_symlinks);
    info!(root = %root.display(), workers, "scan started");

    let shared = Shared {
        cfg,
        host,
        cancel: &cancel,
        probe: ProbeOptions::from_config(cfg),
        counters: Counters::default(),
        reports: Mutex::new(Vec::new()),
    };

    let (cand_tx, cand_rx) = sync_channel(capacity);
    let (go_tx, go_rx) = sync_channel::<Box<GoBinary>>(capacity);
    let (ext_tx, ext_rx) = sync_channel::<Extracted>(capacity);
    let cand_rx = Mutex::new(cand_rx);
    let go_rx = Mutex::new(go_rx);
    let ext_rx = Mutex::new(ext_rx);

    let summary = std::thread::scope(|s| {
        let shared = &shared;
        let walker = {
            let cancel = shared.cancel;
            let walk_opts = &walk_opts;
            s.spawn(move || walk(root, walk_opts, cancel, |c| cand_tx.send(c).is_ok()))
        };
        for _ in 0..workers {
            let tx = go_tx.clone();
            let rx = &cand_rx;
            s.spawn(move || classify_worker(shared, rx, tx));
        }
        drop(go_tx);
        for _ in 0..workers {
            let tx = ext_tx.clone();
            let rx = &go_rx;
            s.spawn(move || extract_worker(shared, rx, tx));
        }
        drop(ext_tx);
        for _ in 0..workers {
            let rx = &ext_rx;
            s.spawn(move || probe_worker(shared, rx));
        }
        walker.join().unwrap_or_default()
    });

    let counters = &shared.counters;
    // A deadline that passed mid-run may only have shortened probe timeouts.
    if summary.stopped_early || cancel.is_cancelled() {
        counters.saw_cancel.store(true, Ordering::SeqCst);
    }
    let mut reports = match shared.reports.into_inner() {
        Ok(r) => r,
        Err(poisoned) => poisoned.into_inner(),
    };
    reports.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let other_executables = counters.other_executables.load(Ordering::SeqCst);
    let stats = ScanStats {
        candidates: summary.emitted,
        other_executables,
        walk_errors: summary.errors,
        unreadable_candidates: counters.unreadable_candidates.load(Ordering::SeqCst),
        peak_concurrent_probes: counters.peak_probes.load(Ordering::SeqCst),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    let aggregate = aggregate(&reports, other_executables);
    info!(
        total = aggregate.total,
        compliant = aggregate.compliant,
        other_executables,
        walk_errors = stats.walk_errors,
        elapsed_ms = stats.elapsed_ms,
        "scan finished"
    );

    let result = ScanResult {
        schema_version: FIPSCHECK_REPORT_SCHEMA_VERSION.to_string(),
        root: root.to_path_buf(),
        host: host.clone(),
        reports,
        aggregate,
        stats,
    };
    if counters.saw_cancel.load(Ordering::SeqCst) {
        return Err(ScanError::Cancelled {
            partial: Box::new(result),
        });
    }
    Ok(result)
}

fn check_root(root: &Path) -> std::result::Result<(), ScanError> {
    let fatal = |reason: String| ScanError::FatalRoot {
        path: root.to_path_buf(),
        reason,
    };
    let md = std::fs::metadata(root).map_err(|e| fatal(e.to_string()))?;
    if !md.is_dir() {
        return Err(fatal("not a directory".to_string()));
    }
    std::fs::read_dir(root).map_err(|e| fatal(e.to_string()))?;
    Ok(())
}

fn recv_shared<T>(rx: &Mutex<Receiver<T>>) -> Option<T> {
    let guard = match rx.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.recv().ok()
}

fn classify_worker(
    shared: &Shared<'_>,
    rx: &Mutex<Receiver<Candidate>>,
    tx: SyncSender<Box<GoBinary>>,
) {
    let counters = &shared.counters;
    while let Some(cand) = recv_shared(rx) {
        // Not yet accepted as a Go binary, so nothing is owed a report.
        if shared.cancel.is_cancelled() {
            counters.saw_cancel.store(true, Ordering::SeqCst);
            continue;
        }
        let path = cand.relative_path.clone();
        match classify(cand) {
            Ok(Classification::Go(bin)) => {
                debug!(path = %path, "go binary");
                if tx.send(bin).is_err() {
                    return;
                }
            }
            Ok(Classification::Other(why)) => {
                debug!(path = %path, reason = why.as_str(), "not a go binary");
                counters.other_executables.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                let err = format!("{err:#}");
                warn!(path = %path, error = %err, "cannot classify candidate");
                counters.unreadable_candidates.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

fn extract_worker(
    shared: &Shared<'_>,
    rx: &Mutex<Receiver<Box<GoBinary>>>,
    tx: SyncSender<Extracted>,
) {
    while let Some(binary) = recv_shared(rx) {
        if shared.cancel.is_cancelled() {
            shared.counters.saw_cancel.store(true, Ordering::SeqCst);
            push_report(shared, cancelled_report(&binary, None, None));
            continue;
        }
        let path = &binary.candidate.absolute_path;
        let metadata = extract_metadata(&binary).map_err(|err| {
            let item = ItemError::unreadable(err);
            warn!(path = %binary.candidate.relative_path, error = %item, "build info unreadable");
            item
        });
        let sha256 = if shared.cfg.hash_binaries {
            match sha256_file(path, shared.cancel) {
                Ok(digest) => digest,
                Err(err) => {
                    let err = format!("{err:#}");
                    warn!(path = %binary.candidate.relative_path, error = %err, "hash failed");
                    None
                }
            }
        } else {
            None
        };
        let item = Extracted {
            binary,
            metadata,
            sha256,
        };
        if let Err(returned) = tx.send(item) {
            // Probe pool is gone; finalize here so the binary still gets a report.
            let item = returned.0;
            push_report(
                shared,
                cancelled_report(&item.binary, item.metadata.ok(), item.sha256),
            );
        }
    }
}

fn extract_metadata(binary: &GoBinary) -> Result<BuildMetadata> {
    let path = &binary.candidate.absolute_path;
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    buildinfo::extract(
        &file,
        &binary.elf,
        &binary.buildinfo,
        DELEGATED_CRYPTO_EXPERIMENT,
    )
    .with_context(|| format!("decode build info: {}", path.display()))
}

fn probe_worker(shared: &Shared<'_>, rx: &Mutex<Receiver<Extracted>>) {
    let counters = &shared.counters;
    while let Some(item) = recv_shared(rx) {
        if shared.cancel.is_cancelled() {
            counters.saw_cancel.store(true, Ordering::SeqCst);
            push_report(
                shared,
                cancelled_report(&item.binary, item.metadata.ok(), item.sha256),
            );
            continue;
        }

        let now = counters.in_flight_probes.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_probes.fetch_max(now, Ordering::SeqCst);
        let runtime = probe_runtime(
            &item.binary.candidate.absolute_path,
            Some(item.binary.elf.machine),
            &shared.probe,
            shared.cancel,
        );
        counters.in_flight_probes.fetch_sub(1, Ordering::SeqCst);

        let (metadata, mut error) = match item.metadata {
            Ok(md) => (Some(md), None),
            Err(err) => (None, Some(err)),
        };
        if runtime.exit == ProbeExit::Cancelled {
            counters.saw_cancel.store(true, Ordering::SeqCst);
            error = Some(ItemError::Cancelled);
        }
        let verdict = evaluate(
            metadata.as_ref(),
            &runtime,
            error.is_some(),
            shared.host.fips_capable,
        );
        debug!(
            path = %item.binary.candidate.relative_path,
            status = %verdict.status,
            reason = verdict.reason.map(|r| r.as_str()).unwrap_or("-"),
            "verdict"
        );
        push_report(
            shared,
            BinaryReport {
                relative_path: item.binary.candidate.relative_path.clone(),
                kind: BinaryKind::GoBinary,
                sha256: item.sha256,
                metadata,
                runtime,
                error,
                verdict,
            },
        );
    }
}

fn cancelled_report(
    binary: &GoBinary,
    metadata: Option<BuildMetadata>,
    sha256: Option<String>,
) -> BinaryReport {
    let runtime = RuntimeOutcome::cancelled();
    let verdict = evaluate(metadata.as_ref(), &runtime, true, false);
    BinaryReport {
        relative_path: binary.candidate.relative_path.clone(),
        kind: BinaryKind::GoBinary,
        sha256,
        metadata,
        runtime,
        error: Some(ItemError::Cancelled),
        verdict,
    }
}

fn push_report(shared: &Shared<'_>, report: BinaryReport) {
    match shared.reports.lock() {
        Ok(mut v) => v.push(report),
        Err(poisoned) => poisoned.into_inner().push(report),
    }
}
