use std::fmt::Write as _;

use fipscheck::{BinaryReport, ScanResult};

const RULE: &str = "─────────────────────────────────────────────────────";

pub fn text(result: &ScanResult) -> String {
    let mut out = String::new();
    host_section(&mut out, result);

    let agg = &result.aggregate;
    let _ = writeln!(out, "\n=== Binary FIPS Check Report ===");
    let _ = writeln!(out, "Root: {}", result.root.display());
    let _ = writeln!(out, "Total binaries scanned: {}", agg.total);
    if agg.other_executables > 0 {
        let _ = writeln!(out, "Other executables skipped: {}", agg.other_executables);
    }
    let _ = writeln!(out);

    if result.reports.is_empty() {
        let _ = writeln!(out, "No Go binaries found.");
    } else {
        let _ = writeln!(out, "Binaries with systemcrypto: {}", agg.uses_delegated_crypto);
        let _ = writeln!(out, "Binaries that fail FIPS check: {}\n", agg.fails_startup);
        for (i, report) in result.reports.iter().enumerate() {
            binary_section(&mut out, i + 1, report);
        }
        let _ = writeln!(out, "{RULE}");
    }

    let _ = writeln!(out, "Summary:");
    let _ = writeln!(
        out,
        "  Total: {} | Compliant: {} | Systemcrypto: {} | Failed FIPS: {}",
        agg.total, agg.compliant, agg.uses_delegated_crypto, agg.fails_startup
    );
    match agg.verdict.reason {
        None => {
            let _ = writeln!(out, "  Verdict: {}", agg.verdict.status);
        }
        Some(reason) => {
            let _ = writeln!(
                out,
                "  Verdict: {} ({})",
                agg.verdict.status,
                reason.describe()
            );
        }
    }
    out
}

fn host_section(out: &mut String, result: &ScanResult) {
    let host = &result.host;
    let _ = writeln!(out, "\n=== Host FIPS Environment Check ===");
    let _ = writeln!(out, "OpenSSL Version: {}", host.library_version);
    let _ = writeln!(out, "FIPS Capable: {}", host.fips_capable);
    if host.fips_capable {
        let _ = writeln!(out, "✅ Status: Host is FIPS capable");
    } else {
        let _ = writeln!(out, "⚠️  Status: Host is NOT FIPS capable");
    }
    if let Some(diag) = &host.diagnostic {
        let _ = writeln!(out, "    {diag}");
    }
}

fn binary_section(out: &mut String, n: usize, report: &BinaryReport) {
    let _ = writeln!(out, "{RULE}");
    let _ = writeln!(out, "[{n}] Binary: {}", report.relative_path);
    let _ = writeln!(out, "    Type: Go binary");
    if let Some(md) = &report.metadata {
        let _ = writeln!(out, "    Go Version: {}", md.go_version);
        if !md.module_path.is_empty() {
            let _ = writeln!(out, "    Module: {}", md.module_path);
        }
        let _ = writeln!(out, "    CGO Enabled: {}", md.native_interop_enabled);
        let _ = writeln!(out, "    Uses Systemcrypto: {}", md.uses_delegated_crypto);
    }
    let _ = writeln!(out, "    Fails on FIPS Check: {}", report.runtime.fails_startup);

    match report.verdict.reason {
        None => {
            let _ = writeln!(out, "    ✅ FIPS Status: {}", report.verdict.status);
        }
        Some(reason) => {
            let _ = writeln!(
                out,
                "    ❌ FIPS Status: {} ({})",
                report.verdict.status,
                reason.describe()
            );
        }
    }

    let log = &report.runtime.captured_stderr;
    if !log.is_empty() {
        let _ = writeln!(out, "    Runtime Output:");
        for line in log.lines().filter(|l| !l.is_empty()) {
            let _ = writeln!(out, "        {line}");
        }
    }
    if let Some(err) = &report.error {
        let _ = writeln!(out, "    ⚠️  Error: {err}");
    }
    let _ = writeln!(out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use fipscheck::verdict::aggregate;
    use fipscheck::{
        BinaryKind, HostCapability, ProbeExit, Reason, RuntimeOutcome, ScanStats, Verdict,
    };

    fn result(reports: Vec<BinaryReport>) -> ScanResult {
        let aggregate = aggregate(&reports, 1);
        ScanResult {
            schema_version: "fipscheck.report@0.1.0".to_string(),
            root: PathBuf::from("/scan"),
            host: HostCapability {
                library_version: "OpenSSL 3.0.13".to_string(),
                fips_capable: true,
                diagnostic: None,
            },
            reports,
            aggregate,
            stats: ScanStats::default(),
        }
    }

    #[test]
    fn empty_tree_says_no_go_binaries() {
        let txt = text(&result(Vec::new()));
        assert!(txt.contains("No Go binaries found."));
        assert!(txt.contains("Other executables skipped: 1"));
        assert!(txt.contains("Verdict: NOT COMPLIANT (no Go binaries found)"));
    }

    #[test]
    fn failing_binary_shows_reason_and_output() {
        let report = BinaryReport {
            relative_path: "usr/bin/app".to_string(),
            kind: BinaryKind::GoBinary,
            sha256: None,
            metadata: None,
            runtime: RuntimeOutcome {
                fails_startup: true,
                captured_stderr: "panic: no FIPS provider\n\ngoroutine 1\n".to_string(),
                stderr_truncated: false,
                exit: ProbeExit::Exited { code: 2 },
                elapsed_ms: 3,
            },
            error: None,
            verdict: Verdict::from_failing(vec![Reason::RuntimeStartupFailed]),
        };
        let txt = text(&result(vec![report]));
        assert!(txt.contains("[1] Binary: usr/bin/app"));
        assert!(txt.contains("❌ FIPS Status: NOT COMPLIANT (runtime check fails)"));
        assert!(txt.contains("        panic: no FIPS provider\n        goroutine 1\n"));
        assert!(txt.contains("Binaries that fail FIPS check: 1"));
    }
}
