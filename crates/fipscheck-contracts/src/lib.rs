//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings and
//! environment variable names that appear in machine-readable I/O.

pub const FIPSCHECK_REPORT_SCHEMA_VERSION: &str = "fipscheck.report@0.1.0";
pub const FIPSCHECK_CONFIG_SCHEMA_VERSION: &str = "fipscheck.config@0.1.0";

/// Read by FIPS-enabled Go toolchains at startup. `1` forces FIPS mode and makes
/// the runtime abort when no FIPS provider can be loaded.
pub const ENV_GOFIPS: &str = "GOFIPS";

/// Absolute path of the libcrypto shared object to probe instead of the default sonames.
pub const ENV_LIBCRYPTO: &str = "FIPSCHECK_LIBCRYPTO";

/// `GOEXPERIMENT` token that routes Go crypto through the host's system library.
pub const DELEGATED_CRYPTO_EXPERIMENT: &str = match option_env!("FIPSCHECK_CRYPTO_EXPERIMENT") {
    Some(token) => token,
    None => "systemcrypto",
};
