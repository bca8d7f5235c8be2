//! Host crypto capability probe.
//!
//! libcrypto is loaded with `dlopen` once per process; the reading is cached and
//! the handle is never closed (OpenSSL installs process-wide state and exit
//! handlers). Worker threads only ever see the cached [`HostCapability`].

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_ulong, c_void};

use fipscheck_contracts::ENV_LIBCRYPTO;
use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, warn};

#[cfg(target_os = "macos")]
const LIBCRYPTO_SONAMES: &[&str] = &["libcrypto.3.dylib", "libcrypto.1.1.dylib", "libcrypto.dylib"];
#[cfg(not(target_os = "macos"))]
const LIBCRYPTO_SONAMES: &[&str] = &[
    "libcrypto.so.3",
    "libcrypto.so.1.1",
    "libcrypto.so.10",
    "libcrypto.so",
];

const OPENSSL_VERSION: c_int = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostCapability {
    pub library_version: String,
    pub fips_capable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl HostCapability {
    pub fn unavailable(diagnostic: impl Into<String>) -> Self {
        HostCapability {
            library_version: String::new(),
            fips_capable: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

static HOST: Lazy<HostCapability> = Lazy::new(|| {
    let candidates: Vec<String> = match std::env::var(ENV_LIBCRYPTO) {
        Ok(path) if !path.trim().is_empty() => vec![path],
        _ => LIBCRYPTO_SONAMES.iter().map(|s| s.to_string()).collect(),
    };
    let cap = probe_libcrypto(&candidates);
    match &cap.diagnostic {
        Some(diag) => warn!(diagnostic = %diag, "host crypto library unavailable"),
        None => debug!(
            version = %cap.library_version,
            fips_capable = cap.fips_capable,
            "host crypto library"
        ),
    }
    cap
});

/// The host reading for this process. The first call performs the probe.
pub fn check_host() -> HostCapability {
    HOST.clone()
}

type VersionNumFn = unsafe extern "C" fn() -> c_ulong;
type VersionTextFn = unsafe extern "C" fn(c_int) -> *const c_char;
type FipsModeFn = unsafe extern "C" fn() -> c_int;
type PropsFipsEnabledFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type MdFetchFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char) -> *mut c_void;
type MdFreeFn = unsafe extern "C" fn(*mut c_void);

struct Libcrypto {
    handle: *mut c_void,
}

impl Libcrypto {
    fn open(candidates: &[String]) -> Result<Libcrypto, String> {
        let mut errors: Vec<String> = Vec::new();
        for name in candidates {
            let Ok(cname) = CString::new(name.as_str()) else {
                errors.push(format!("{name}: contains NUL"));
                continue;
            };
            let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            if !handle.is_null() {
                return Ok(Libcrypto { handle });
            }
            errors.push(format!("{name}: {}", last_dl_error()));
        }
        Err(format!("cannot load libcrypto ({})", errors.join("; ")))
    }

    fn sym(&self, name: &CStr) -> Option<*mut c_void> {
        let p = unsafe { libc::dlsym(self.handle, name.as_ptr()) };
        (!p.is_null()).then_some(p)
    }

    fn version_num(&self) -> Option<c_ulong> {
        let p = self
            .sym(c"OpenSSL_version_num")
            .or_else(|| self.sym(c"SSLeay"))?;
        let f: VersionNumFn = unsafe { std::mem::transmute::<*mut c_void, VersionNumFn>(p) };
        Some(unsafe { f() })
    }

    fn version_text(&self) -> Option<String> {
        let p = self
            .sym(c"OpenSSL_version")
            .or_else(|| self.sym(c"SSLeay_version"))?;
        let f: VersionTextFn = unsafe { std::mem::transmute::<*mut c_void, VersionTextFn>(p) };
        let s = unsafe { f(OPENSSL_VERSION) };
        if s.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned())
    }

    /// OpenSSL 3: FIPS properties already on, or a `fips=yes` digest can be fetched.
    fn fips_capable_v3(&self) -> bool {
        if let Some(p) = self.sym(c"EVP_default_properties_is_fips_enabled") {
            let f: PropsFipsEnabledFn =
                unsafe { std::mem::transmute::<*mut c_void, PropsFipsEnabledFn>(p) };
            if unsafe { f(std::ptr::null_mut()) } == 1 {
                return true;
            }
        }
        let (Some(fetch), Some(free)) = (self.sym(c"EVP_MD_fetch"), self.sym(c"EVP_MD_free"))
        else {
            return false;
        };
        let fetch: MdFetchFn = unsafe { std::mem::transmute::<*mut c_void, MdFetchFn>(fetch) };
        let free: MdFreeFn = unsafe { std::mem::transmute::<*mut c_void, MdFreeFn>(free) };
        let md = unsafe { fetch(std::ptr::null_mut(), c"SHA2-256".as_ptr(), c"fips=yes".as_ptr()) };
        if md.is_null() {
            return false;
        }
        unsafe { free(md) };
        true
    }

    /// OpenSSL 1.x: only a library already switched into FIPS mode counts.
    fn fips_capable_v1(&self) -> bool {
        let Some(p) = self.sym(c"FIPS_mode") else {
            return false;
        };
        let f: FipsModeFn = unsafe { std::mem::transmute::<*mut c_void, FipsModeFn>(p) };
        unsafe { f() == 1 }
    }
}

fn last_dl_error() -> String {
    let e = unsafe { libc::dlerror() };
    if e.is_null() {
        return "unknown dlopen error".to_string();
    }
    unsafe { CStr::from_ptr(e) }.to_string_lossy().into_owned()
}

/// Loads the first libcrypto that opens from `candidates` and reads its version
/// and FIPS capability. Load failures produce a non-capable reading.
pub(crate) fn probe_libcrypto(candidates: &[String]) -> HostCapability {
    let lib = match Libcrypto::open(candidates) {
        Ok(lib) => lib,
        Err(diag) => return HostCapability::unavailable(diag),
    };

    let library_version = lib.version_text().unwrap_or_default();
    let Some(num) = lib.version_num() else {
        return HostCapability {
            library_version,
            fips_capable: false,
            diagnostic: Some("libcrypto exports no version function".to_string()),
        };
    };
    let major = (num >> 28) & 0xf;
    let fips_capable = match major {
        3 => lib.fips_capable_v3(),
        1 => lib.fips_capable_v1(),
        _ => false,
    };
    let diagnostic = (!matches!(major, 1 | 3))
        .then(|| format!("unsupported libcrypto major version {major}"));

    HostCapability {
        library_version,
        fips_capable,
        diagnostic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_not_capable() {
        let cap = probe_libcrypto(&["/nonexistent/libcrypto-fipscheck.so".to_string()]);
        assert!(!cap.fips_capable);
        assert_eq!(cap.library_version, "");
        let diag = cap.diagnostic.expect("diagnostic");
        assert!(diag.contains("cannot load libcrypto"), "{diag}");
    }

    #[test]
    fn cached_reading_is_stable() {
        let a = check_host();
        let b = check_host();
        assert_eq!(a, b);
        if a.diagnostic.is_none() {
            assert!(!a.library_version.is_empty());
        }
    }
}
