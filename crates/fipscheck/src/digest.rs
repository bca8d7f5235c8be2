use std::fs::File;
use std::io::{BufReader, Read as _};
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest as _, Sha256};

use crate::cancel::CancelToken;

/// Streams the file through SHA-256 with a fixed buffer. Returns `Ok(None)` when
/// cancelled part-way.
pub fn sha256_file(path: &Path, cancel: &CancelToken) -> Result<Option<String>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut h = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = r
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(Some(format!("sha256:{:x}", h.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_file_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("abc");
        std::fs::write(&p, b"abc").expect("write");
        let got = sha256_file(&p, &CancelToken::new()).expect("hash");
        assert_eq!(
            got.as_deref(),
            Some("sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(sha256_file(&p, &cancel).expect("hash"), None);
    }
}
