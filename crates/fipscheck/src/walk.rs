use std::fs::File;
use std::io::Read as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::elf::has_elf_magic;

/// Pruned whenever the scan root is `/`.
pub const PSEUDO_FS_DIRS: &[&str] = &["proc", "sys", "dev", "run"];

const EXEC_BITS: u32 = 0o111;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub absolute_path: PathBuf,
    /// Path below the scan root, `/`-separated, no leading slash.
    pub relative_path: String,
    pub size: u64,
    pub mode: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    pub emitted: usize,
    pub errors: usize,
    pub stopped_early: bool,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub follow_symlinks: bool,
    pub prune: Vec<PathBuf>,
}

impl WalkOptions {
    /// Joins the configured prune list with the pseudo-filesystems for a `/` root.
    pub fn for_root(root: &Path, prune: &[String], follow_symlinks: bool) -> Self {
        let mut dirs: Vec<PathBuf> = prune.iter().map(PathBuf::from).collect();
        if root == Path::new("/") {
            for d in PSEUDO_FS_DIRS {
                let p = PathBuf::from(d);
                if !dirs.contains(&p) {
                    dirs.push(p);
                }
            }
        }
        WalkOptions {
            follow_symlinks,
            prune: dirs,
        }
    }
}

pub fn relative_path_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts: Vec<String> = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

fn looks_executable(path: &Path, mode: u32) -> bool {
    if mode & EXEC_BITS != 0 {
        return true;
    }
    let Ok(mut f) = File::open(path) else {
        return false;
    };
    let mut prefix = [0u8; 4];
    match f.read_exact(&mut prefix) {
        Ok(()) => has_elf_magic(&prefix),
        Err(_) => false,
    }
}

/// Walks `root` and hands every candidate executable to `emit`. Stops when the
/// token is cancelled or `emit` returns `false` (receiver gone).
pub fn walk<F>(root: &Path, opts: &WalkOptions, cancel: &CancelToken, mut emit: F) -> WalkSummary
where
    F: FnMut(Candidate) -> bool,
{
    let mut summary = WalkSummary::default();
    let prune = &opts.prune;
    let iter = WalkDir::new(root)
        .follow_links(opts.follow_symlinks)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            match entry.path().strip_prefix(root) {
                Ok(rel) => !prune.iter().any(|p| p == rel),
                Err(_) => true,
            }
        });

    for entry in iter {
        if cancel.is_cancelled() {
            summary.stopped_early = true;
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                summary.errors += 1;
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        // Symlinks, devices, sockets and fifos all fail this check; when following
        // links the walker already reports the target's type.
        if !entry.file_type().is_file() {
            continue;
        }
        let md = match entry.metadata() {
            Ok(md) => md,
            Err(err) => {
                summary.errors += 1;
                warn!(path = %entry.path().display(), error = %err, "stat failed");
                continue;
            }
        };
        let mode = md.permissions().mode();
        if !looks_executable(entry.path(), mode) {
            continue;
        }
        let Some(relative_path) = relative_path_string(root, entry.path()) else {
            continue;
        };
        debug!(path = %relative_path, size = md.len(), "candidate");
        let cand = Candidate {
            absolute_path: entry.into_path(),
            relative_path,
            size: md.len(),
            mode,
        };
        summary.emitted += 1;
        if !emit(cand) {
            summary.stopped_early = true;
            break;
        }
    }

    summary
}
