use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::buildinfo::BuildMetadata;
use crate::probe::RuntimeOutcome;
use crate::report::BinaryReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    Compliant,
    NotCompliant,
}

/// Why a binary (or a whole scan) is not compliant. Declaration order is the
/// predicate order: the first failing one becomes the primary reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Unreadable,
    DelegatedCryptoNotUsed,
    NativeInteropDisabled,
    RuntimeStartupFailed,
    HostNotCapable,
    /// Aggregate only: the tree contains no Go executables.
    NoCandidates,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Unreadable => "unreadable",
            Reason::DelegatedCryptoNotUsed => "delegated_crypto_not_used",
            Reason::NativeInteropDisabled => "native_interop_disabled",
            Reason::RuntimeStartupFailed => "runtime_startup_failed",
            Reason::HostNotCapable => "host_not_capable",
            Reason::NoCandidates => "no_candidates",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Reason::Unreadable => "binary could not be read",
            Reason::DelegatedCryptoNotUsed => "systemcrypto not in use",
            Reason::NativeInteropDisabled => "cgo disabled",
            Reason::RuntimeStartupFailed => "runtime check fails",
            Reason::HostNotCapable => "host not FIPS capable",
            Reason::NoCandidates => "no Go binaries found",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub status: Compliance,
    /// Primary reason; `None` iff compliant.
    pub reason: Option<Reason>,
    /// Every failing predicate, in predicate order.
    pub failing: Vec<Reason>,
}

impl Verdict {
    pub fn from_failing(failing: Vec<Reason>) -> Self {
        Verdict {
            status: if failing.is_empty() {
                Compliance::Compliant
            } else {
                Compliance::NotCompliant
            },
            reason: failing.first().copied(),
            failing,
        }
    }

    pub fn is_compliant(&self) -> bool {
        self.status == Compliance::Compliant
    }
}

/// Per-binary verdict. Compliant iff the binary uses delegated crypto, was built
/// with cgo, starts under `GOFIPS=1`, and the host can supply a FIPS provider.
/// A report-level error dominates: downstream fields are best-effort then.
pub fn evaluate(
    metadata: Option<&BuildMetadata>,
    runtime: &RuntimeOutcome,
    has_error: bool,
    host_fips_capable: bool,
) -> Verdict {
    if has_error {
        return Verdict::from_failing(vec![Reason::Unreadable]);
    }
    let Some(md) = metadata else {
        return Verdict::from_failing(vec![Reason::Unreadable]);
    };

    let mut failing = Vec::new();
    if !md.uses_delegated_crypto {
        failing.push(Reason::DelegatedCryptoNotUsed);
    }
    if !md.native_interop_enabled {
        failing.push(Reason::NativeInteropDisabled);
    }
    if runtime.fails_startup {
        failing.push(Reason::RuntimeStartupFailed);
    }
    if !host_fips_capable {
        failing.push(Reason::HostNotCapable);
    }
    Verdict::from_failing(failing)
}

/// Boolean form of [`evaluate`] for callers that only need the answer.
pub fn is_binary_fips_compliant(
    metadata: &BuildMetadata,
    runtime: &RuntimeOutcome,
    host_fips_capable: bool,
) -> bool {
    evaluate(Some(metadata), runtime, false, host_fips_capable).is_compliant()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    /// Go executables examined (excludes `other_executables`).
    pub total: usize,
    pub compliant: usize,
    /// Non-compliant reports keyed by primary reason.
    pub not_compliant: BTreeMap<Reason, usize>,
    pub uses_delegated_crypto: usize,
    pub fails_startup: usize,
    pub other_executables: usize,
    pub verdict: Verdict,
}

/// Rolls up reports that are already sorted by path.
pub fn aggregate(reports: &[BinaryReport], other_executables: usize) -> Aggregate {
    let mut not_compliant: BTreeMap<Reason, usize> = BTreeMap::new();
    let mut compliant = 0usize;
    let mut uses_delegated_crypto = 0usize;
    let mut fails_startup = 0usize;
    let mut first_failure: Option<Reason> = None;

    for r in reports {
        if r.metadata.as_ref().is_some_and(|m| m.uses_delegated_crypto) {
            uses_delegated_crypto += 1;
        }
        if r.runtime.fails_startup {
            fails_startup += 1;
        }
        match r.verdict.reason {
            None => compliant += 1,
            Some(reason) => {
                *not_compliant.entry(reason).or_insert(0) += 1;
                first_failure.get_or_insert(reason);
            }
        }
    }

    let verdict = if reports.is_empty() {
        Verdict::from_failing(vec![Reason::NoCandidates])
    } else {
        Verdict::from_failing(first_failure.into_iter().collect())
    };

    Aggregate {
        total: reports.len(),
        compliant,
        not_compliant,
        uses_delegated_crypto,
        fails_startup,
        other_executables,
        verdict,
    }
}

impl fmt::Display for Compliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compliance::Compliant => f.write_str("COMPLIANT"),
            Compliance::NotCompliant => f.write_str("NOT COMPLIANT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeExit;
    use crate::report::BinaryKind;

    fn metadata(delegated: bool, cgo: bool) -> BuildMetadata {
        BuildMetadata {
            go_version: "go1.22.4".to_string(),
            module_path: "example.com/app".to_string(),
            module_version: String::new(),
            package_path: String::new(),
            native_interop_enabled: cgo,
            uses_delegated_crypto: delegated,
            experiments: Vec::new(),
            settings: BTreeMap::new(),
            deps: Vec::new(),
        }
    }

    fn outcome(fails: bool) -> RuntimeOutcome {
        RuntimeOutcome {
            fails_startup: fails,
            captured_stderr: String::new(),
            stderr_truncated: false,
            exit: ProbeExit::Exited {
                code: if fails { 2 } else { 0 },
            },
            elapsed_ms: 0,
        }
    }

    fn report(path: &str, verdict: Verdict) -> BinaryReport {
        BinaryReport {
            relative_path: path.to_string(),
            kind: BinaryKind::GoBinary,
            sha256: None,
            metadata: Some(metadata(true, true)),
            runtime: outcome(false),
            error: None,
            verdict,
        }
    }

    #[test]
    fn truth_table() {
        for bits in 0u8..16 {
            let delegated = bits & 1 != 0;
            let cgo = bits & 2 != 0;
            let fails = bits & 4 != 0;
            let host = bits & 8 != 0;
            let v = evaluate(Some(&metadata(delegated, cgo)), &outcome(fails), false, host);
            let expect = delegated && cgo && !fails && host;
            assert_eq!(v.is_compliant(), expect, "bits={bits:04b}");
            assert_eq!(v.reason.is_none(), expect);
            assert_eq!(
                is_binary_fips_compliant(&metadata(delegated, cgo), &outcome(fails), host),
                expect
            );

            let mut want = Vec::new();
            if !delegated {
                want.push(Reason::DelegatedCryptoNotUsed);
            }
            if !cgo {
                want.push(Reason::NativeInteropDisabled);
            }
            if fails {
                want.push(Reason::RuntimeStartupFailed);
            }
            if !host {
                want.push(Reason::HostNotCapable);
            }
            assert_eq!(v.failing, want);
            assert_eq!(v.reason, want.first().copied());
        }
    }

    #[test]
    fn errors_dominate() {
        let v = evaluate(Some(&metadata(true, true)), &outcome(false), true, true);
        assert_eq!(v.reason, Some(Reason::Unreadable));
        let v = evaluate(None, &outcome(false), false, true);
        assert_eq!(v.reason, Some(Reason::Unreadable));
    }

    #[test]
    fn aggregate_rollup() {
        let empty = aggregate(&[], 3);
        assert_eq!(empty.verdict.reason, Some(Reason::NoCandidates));
        assert_eq!(empty.other_executables, 3);

        let ok = Verdict::from_failing(Vec::new());
        let bad = Verdict::from_failing(vec![Reason::RuntimeStartupFailed]);
        let all_ok = aggregate(&[report("a", ok.clone()), report("b", ok.clone())], 0);
        assert!(all_ok.verdict.is_compliant());
        assert_eq!(all_ok.compliant, 2);

        let mixed = aggregate(&[report("a", ok), report("b", bad)], 0);
        assert!(!mixed.verdict.is_compliant());
        assert_eq!(mixed.verdict.reason, Some(Reason::RuntimeStartupFailed));
        assert_eq!(mixed.not_compliant.get(&Reason::RuntimeStartupFailed), Some(&1));
        assert_eq!(mixed.total, 2);
        assert_eq!(mixed.compliant, 1);
    }
}
