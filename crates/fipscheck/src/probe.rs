//! Runtime probe: runs a binary once with `GOFIPS=1` and classifies how its
//! startup went.
//!
//! The child gets its own session (so it has no controlling tty and its whole
//! process group can be signalled), no stdin, and no core dumps. When the
//! leader exits the group is SIGKILLed before the leader is reaped, so helpers
//! it spawned cannot outlive the probe.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fipscheck_contracts::ENV_GOFIPS;
use serde::Serialize;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::ScanConfig;
use crate::elf::Machine;

pub const TRUNCATION_MARKER: &str = "\n[fipscheck: output truncated]\n";

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const SPAWN_BUSY_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    pub timeout: Duration,
    pub output_cap: usize,
    pub kill_grace: Duration,
}

impl ProbeOptions {
    pub fn from_config(cfg: &ScanConfig) -> Self {
        ProbeOptions {
            timeout: cfg.probe_timeout(),
            output_cap: cfg.output_cap_bytes,
            kill_grace: cfg.kill_grace(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeExit {
    Exited { code: i32 },
    Signaled { signal: i32, name: String },
    TimedOut { timeout_ms: u64 },
    NotExecuted { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeOutcome {
    pub fails_startup: bool,
    /// Child stderr plus any probe marker line, never longer than the output cap.
    pub captured_stderr: String,
    pub stderr_truncated: bool,
    pub exit: ProbeExit,
    pub elapsed_ms: u64,
}

impl RuntimeOutcome {
    /// Outcome for an item that cancellation reached before its probe started.
    pub fn cancelled() -> Self {
        finish(ProbeExit::Cancelled, &[], false, Duration::ZERO, usize::MAX)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.exit, ProbeExit::TimedOut { .. })
    }
}

/// Runs `path` once and classifies the result. Never fails: every problem is
/// folded into the returned outcome with `fails_startup = true`.
///
/// When `machine` is given and differs from the host's, nothing is executed.
pub fn probe_runtime(
    path: &Path,
    machine: Option<Machine>,
    opts: &ProbeOptions,
    cancel: &CancelToken,
) -> RuntimeOutcome {
    let start = Instant::now();
    let cap = opts.output_cap;
    if cancel.is_cancelled() {
        return RuntimeOutcome::cancelled();
    }
    if let Some(reason) = machine.and_then(arch_mismatch) {
        debug!(path = %path.display(), %reason, "probe skipped");
        return finish(ProbeExit::NotExecuted { reason }, &[], false, start.elapsed(), cap);
    }

    let program = match absolute_program(path) {
        Ok(p) => p,
        Err(err) => {
            let reason = format!("resolve {}: {err}", path.display());
            return finish(ProbeExit::NotExecuted { reason }, &[], false, start.elapsed(), cap);
        }
    };
    let mut child = match spawn_isolated(&program) {
        Ok(child) => child,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "probe spawn failed");
            let reason = format!("spawn: {err}");
            return finish(ProbeExit::NotExecuted { reason }, &[], false, start.elapsed(), cap);
        }
    };
    let pgid = i32::try_from(child.id()).ok();

    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut readers = 0usize;
    if let Some(mut stdout) = child.stdout.take() {
        let done = done_tx.clone();
        readers += 1;
        std::thread::spawn(move || {
            let _ = std::io::copy(&mut stdout, &mut std::io::sink());
            let _ = done.send(());
        });
    }
    let capture = Arc::new(Mutex::new(Capture::default()));
    if let Some(stderr) = child.stderr.take() {
        let done = done_tx.clone();
        let sink = Arc::clone(&capture);
        readers += 1;
        std::thread::spawn(move || {
            let _ = read_capped_into(stderr, cap, &sink);
            let _ = done.send(());
        });
    }
    drop(done_tx);

    let timeout = cancel
        .remaining()
        .map_or(opts.timeout, |left| left.min(opts.timeout));
    let ended = supervise(&mut child, pgid, timeout, opts.kill_grace, cancel);

    // Readers finish once every holder of the pipes is dead. A descendant that
    // escaped the group may keep them open; stop waiting after a short grace.
    let drain_until = Instant::now() + DRAIN_GRACE;
    for _ in 0..readers {
        let left = drain_until.saturating_duration_since(Instant::now());
        if done_rx.recv_timeout(left).is_err() {
            break;
        }
    }
    let (bytes, truncated) = match capture.lock() {
        Ok(c) => (c.bytes.clone(), c.truncated),
        Err(poisoned) => {
            let c = poisoned.into_inner();
            (c.bytes.clone(), c.truncated)
        }
    };

    let exit = match ended {
        Ok(Ended::Status(status)) => exit_from_status(status),
        Ok(Ended::TimedOut) => ProbeExit::TimedOut {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
        Ok(Ended::Cancelled) => ProbeExit::Cancelled,
        Err(err) => ProbeExit::NotExecuted {
            reason: format!("wait: {err}"),
        },
    };
    let outcome = finish(exit, &bytes, truncated, start.elapsed(), cap);
    debug!(
        path = %path.display(),
        exit = ?outcome.exit,
        elapsed_ms = outcome.elapsed_ms,
        "probe finished"
    );
    outcome
}

fn arch_mismatch(machine: Machine) -> Option<String> {
    match Machine::host() {
        Some(host) if host == machine => None,
        Some(host) => Some(format!(
            "binary targets {} but host is {}",
            machine.name(),
            host.name()
        )),
        None => Some(format!(
            "binary targets {} and the host machine is unknown",
            machine.name()
        )),
    }
}

fn absolute_program(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Spawns the child once. `ETXTBSY` means the exec never happened (another
/// thread's fork still held a write handle to the file), so only that error
/// repeats the spawn; a binary that started is never run a second time.
fn spawn_isolated(program: &Path) -> std::io::Result<Child> {
    let cwd = match program.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("/"),
    };
    let mut attempt = 0u32;
    loop {
        let mut cmd = Command::new(program);
        cmd.env(ENV_GOFIPS, "1");
        cmd.current_dir(&cwd);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        {
            use std::os::unix::process::CommandExt as _;
            unsafe {
                cmd.pre_exec(isolate_child);
            }
        }
        match cmd.spawn() {
            Err(err)
                if err.raw_os_error() == Some(libc::ETXTBSY) && attempt < SPAWN_BUSY_RETRIES =>
            {
                attempt += 1;
                std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
            }
            other => return other,
        }
    }
}

fn isolate_child() -> std::io::Result<()> {
    unsafe {
        if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
            return Err(std::io::Error::last_os_error());
        }
        let core = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

enum Ended {
    Status(ExitStatus),
    TimedOut,
    Cancelled,
}

fn supervise(
    child: &mut Child,
    pgid: Option<i32>,
    timeout: Duration,
    grace: Duration,
    cancel: &CancelToken,
) -> std::io::Result<Ended> {
    let start = Instant::now();
    loop {
        match leader_exited(child) {
            Ok(true) => {
                // The unreaped leader keeps the group id reserved until this kill lands.
                signal_group(pgid, libc::SIGKILL);
                return Ok(Ended::Status(child.wait()?));
            }
            Ok(false) => {}
            Err(err) => {
                hard_kill(child, pgid);
                return Err(err);
            }
        }
        if cancel.is_cancelled() {
            terminate(child, pgid, grace)?;
            return Ok(Ended::Cancelled);
        }
        if start.elapsed() >= timeout {
            hard_kill(child, pgid);
            child.wait()?;
            return Ok(Ended::TimedOut);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM to the group, SIGKILL whatever is left after `grace`.
fn terminate(child: &mut Child, pgid: Option<i32>, grace: Duration) -> std::io::Result<()> {
    signal_group(pgid, libc::SIGTERM);
    let until = Instant::now() + grace;
    while !leader_exited(child)? && Instant::now() < until {
        std::thread::sleep(POLL_INTERVAL);
    }
    hard_kill(child, pgid);
    child.wait()?;
    Ok(())
}

/// Reports whether the leader has exited without reaping it, so its pid and
/// process group id stay reserved until the group has been killed.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn leader_exited(child: &mut Child) -> std::io::Result<bool> {
    let pid = child.id() as libc::id_t;
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { info.si_pid() } != 0)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn leader_exited(child: &mut Child) -> std::io::Result<bool> {
    Ok(child.try_wait()?.is_some())
}

fn hard_kill(child: &mut Child, pgid: Option<i32>) {
    signal_group(pgid, libc::SIGKILL);
    let _ = child.kill();
}

fn signal_group(pgid: Option<i32>, sig: libc::c_int) {
    let Some(pgid) = pgid.filter(|p| *p > 1) else {
        return;
    };
    unsafe {
        let _ = libc::kill(-pgid, sig);
    }
}

fn exit_from_status(status: ExitStatus) -> ProbeExit {
    use std::os::unix::process::ExitStatusExt as _;
    match (status.code(), status.signal()) {
        (Some(code), _) => ProbeExit::Exited { code },
        (None, Some(signal)) => ProbeExit::Signaled {
            signal,
            name: signal_name(signal),
        },
        (None, None) => ProbeExit::Exited { code: -1 },
    }
}

pub fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSYS => "SIGSYS",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        _ => return format!("signal {signal}"),
    };
    name.to_string()
}

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Keeps the first `cap` bytes and drains the rest so the writer never blocks.
fn read_capped_into<R: Read>(
    mut reader: R,
    cap: usize,
    sink: &Mutex<Capture>,
) -> std::io::Result<()> {
    let mut tmp = [0u8; 8192];
    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            return Ok(());
        }
        let Ok(mut c) = sink.lock() else {
            continue;
        };
        if c.truncated {
            continue;
        }
        let remaining = cap.saturating_sub(c.bytes.len());
        if n <= remaining {
            c.bytes.extend_from_slice(&tmp[..n]);
        } else {
            c.bytes.extend_from_slice(&tmp[..remaining]);
            c.truncated = true;
        }
    }
}

fn finish(
    exit: ProbeExit,
    stderr: &[u8],
    truncated: bool,
    elapsed: Duration,
    cap: usize,
) -> RuntimeOutcome {
    let marker = match &exit {
        ProbeExit::TimedOut { timeout_ms } => {
            Some(format!("fipscheck: probe timed out after {timeout_ms} ms"))
        }
        ProbeExit::NotExecuted { reason } => Some(format!("fipscheck: not executed: {reason}")),
        ProbeExit::Cancelled => Some("fipscheck: cancelled".to_string()),
        ProbeExit::Exited { .. } | ProbeExit::Signaled { .. } => None,
    };
    let (captured_stderr, stderr_truncated) =
        compose_stderr(stderr, truncated, marker.as_deref(), cap);
    RuntimeOutcome {
        fails_startup: exit != ProbeExit::Exited { code: 0 },
        captured_stderr,
        stderr_truncated,
        exit,
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Joins captured output, the truncation marker and a status line so the
/// result never exceeds `cap` bytes.
fn compose_stderr(
    body: &[u8],
    truncated: bool,
    marker: Option<&str>,
    cap: usize,
) -> (String, bool) {
    let mut status = marker.map(|m| format!("{m}\n")).unwrap_or_default();
    truncate_at_char_boundary(&mut status, cap / 2);

    let mut text = String::from_utf8_lossy(body).into_owned();
    let budget = cap.saturating_sub(status.len() + 1);
    let mut truncated = truncated;
    if truncated || text.len() > budget {
        truncated = true;
        truncate_at_char_boundary(&mut text, budget.saturating_sub(TRUNCATION_MARKER.len()));
        text.push_str(TRUNCATION_MARKER);
    }
    if !status.is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&status);
    }
    (text, truncated)
}

fn truncate_at_char_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut n = max;
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    s.truncate(n);
}
