//! Scans a filesystem tree for Go executables and decides whether each one is
//! built for, and able to start in, FIPS mode on this host.

use std::path::Path;

pub mod buildinfo;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod digest;
pub mod elf;
pub mod error;
pub mod host;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod verdict;
pub mod walk;

pub use cancel::CancelToken;
pub use config::ScanConfig;
pub use error::{ItemError, ScanError};
pub use host::{check_host, HostCapability};
pub use probe::{ProbeExit, RuntimeOutcome};
pub use report::{BinaryKind, BinaryReport, ScanResult, ScanStats};
pub use verdict::{is_binary_fips_compliant, Aggregate, Compliance, Reason, Verdict};

/// Scans `root` with the host reading taken by the caller.
///
/// Only an unusable root or config fails the call; problems with individual
/// binaries end up on their reports. A cancelled run returns
/// [`ScanError::Cancelled`] carrying everything finished so far.
pub fn check_binaries(
    root: &Path,
    config: &ScanConfig,
    host: &HostCapability,
    cancel: &CancelToken,
) -> Result<ScanResult, ScanError> {
    scheduler::run_scan(root, config, host, cancel)
}
