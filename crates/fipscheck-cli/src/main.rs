use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fipscheck::{check_binaries, check_host, CancelToken, ScanConfig, ScanError, ScanResult};
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum Format {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "fips-checker")]
#[command(
    about = "Checks the Go executables under a root for FIPS readiness.",
    long_about = None
)]
struct Cli {
    /// Directory to scan, typically an extracted image root.
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// JSON scan config (`fipscheck.config@0.1.0`). Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    output_cap_bytes: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    /// Root-relative directory to skip; repeatable.
    #[arg(long)]
    prune: Vec<String>,

    #[arg(long)]
    follow_symlinks: bool,

    /// Global budget for the whole scan.
    #[arg(long)]
    deadline_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[arg(short, long)]
    verbose: bool,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = build_config(&cli)?;
    let host = check_host();
    let cancel = CancelToken::new();
    watch_interrupts(cancel.clone());

    match check_binaries(&cli.root, &config, &host, &cancel) {
        Ok(result) => {
            emit(&result, cli.format)?;
            Ok(if result.is_compliant() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Err(ScanError::Cancelled { partial }) => {
            emit(&partial, cli.format)?;
            eprintln!("error: scan cancelled; report is partial");
            Ok(ExitCode::from(2))
        }
        Err(err) => Err(err.into()),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("fipscheck=debug,warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fipscheck=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_config(cli: &Cli) -> Result<ScanConfig> {
    let mut cfg = match &cli.config {
        Some(path) => ScanConfig::load(path)?,
        None => ScanConfig::default(),
    };
    if let Some(v) = cli.timeout_ms {
        cfg.probe_timeout_ms = v;
    }
    if let Some(v) = cli.output_cap_bytes {
        cfg.output_cap_bytes = v;
    }
    if let Some(v) = cli.workers {
        cfg.workers = v;
    }
    if cli.deadline_ms.is_some() {
        cfg.deadline_ms = cli.deadline_ms;
    }
    if cli.follow_symlinks {
        cfg.follow_symlinks = true;
    }
    cfg.prune.extend(cli.prune.iter().cloned());
    cfg.validate()
        .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    Ok(cfg)
}

/// SIGINT/SIGTERM only set a flag; a watcher thread turns it into cancellation.
fn watch_interrupts(cancel: CancelToken) {
    unsafe {
        let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            tracing::warn!("interrupted; cancelling scan");
            cancel.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    });
}

fn emit(result: &ScanResult, format: Format) -> Result<()> {
    match format {
        Format::Json => {
            let txt = serde_json::to_string_pretty(result).context("serialize report")?;
            println!("{txt}");
        }
        Format::Text => print!("{}", render::text(result)),
    }
    Ok(())
}
