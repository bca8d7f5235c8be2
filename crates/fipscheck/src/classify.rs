use std::fs::File;

use anyhow::{Context, Result};

use crate::buildinfo::{self, BuildInfoError, BuildInfoHeader};
use crate::elf::{ElfError, ElfFile};
use crate::walk::Candidate;

/// A candidate accepted as a Go executable. Carries everything the later stages
/// need so they never re-parse the headers.
#[derive(Debug, Clone)]
pub struct GoBinary {
    pub candidate: Candidate,
    pub elf: ElfFile,
    pub buildinfo: BuildInfoHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotGo {
    NotElf,
    MalformedElf,
    NotExecutable,
    NoBuildInfo,
}

impl NotGo {
    pub fn as_str(self) -> &'static str {
        match self {
            NotGo::NotElf => "not an ELF file",
            NotGo::MalformedElf => "malformed ELF",
            NotGo::NotExecutable => "ELF is not an executable",
            NotGo::NoBuildInfo => "no Go build info",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Classification {
    Go(Box<GoBinary>),
    Other(NotGo),
}

/// Opens the candidate, checks the ELF header and looks for the build info
/// magic. The file is closed before returning.
///
/// Errors are I/O failures on the file itself; anything that merely fails to
/// look like a Go executable is `Classification::Other`.
pub fn classify(candidate: Candidate) -> Result<Classification> {
    let file = File::open(&candidate.absolute_path)
        .with_context(|| format!("open {}", candidate.absolute_path.display()))?;
    classify_open(candidate, &file)
}

fn classify_open(candidate: Candidate, file: &File) -> Result<Classification> {
    let elf = match ElfFile::parse(file) {
        Ok(elf) => elf,
        Err(ElfError::NotElf) => return Ok(Classification::Other(NotGo::NotElf)),
        Err(ElfError::Truncated) | Err(ElfError::Malformed(_)) => {
            return Ok(Classification::Other(NotGo::MalformedElf))
        }
        Err(ElfError::Io(err)) => {
            return Err(err)
                .with_context(|| format!("read {}", candidate.absolute_path.display()))
        }
    };
    if !elf.is_executable_type() {
        return Ok(Classification::Other(NotGo::NotExecutable));
    }

    match buildinfo::locate(file, &elf) {
        Ok(Some(header)) => Ok(Classification::Go(Box::new(GoBinary {
            candidate,
            elf,
            buildinfo: header,
        }))),
        Ok(None) => Ok(Classification::Other(NotGo::NoBuildInfo)),
        Err(BuildInfoError::Elf(ElfError::Io(err))) => {
            Err(err).with_context(|| format!("read {}", candidate.absolute_path.display()))
        }
        Err(_) => Ok(Classification::Other(NotGo::NoBuildInfo)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn candidate(path: PathBuf) -> Candidate {
        Candidate {
            relative_path: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            absolute_path: path,
            size: 0,
            mode: 0o755,
        }
    }

    #[test]
    fn scripts_and_garbage_are_other() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let script = tmp.path().join("script");
        std::fs::write(&script, b"#!/bin/sh\nexit 0\n").expect("write");
        let c = classify(candidate(script)).expect("classify");
        assert!(matches!(c, Classification::Other(NotGo::NotElf)));

        let broken = tmp.path().join("broken");
        let mut bytes = b"\x7fELF\x09\x01\x01".to_vec();
        bytes.resize(64, 0);
        std::fs::write(&broken, bytes).expect("write");
        let c = classify(candidate(broken)).expect("classify");
        assert!(matches!(c, Classification::Other(NotGo::MalformedElf)));
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(classify(candidate(tmp.path().join("gone"))).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_test_binary_is_not_go() {
        let exe = std::env::current_exe().expect("current exe");
        match classify(candidate(exe)).expect("classify") {
            Classification::Other(reason) => assert_ne!(reason, NotGo::NotElf),
            Classification::Go(_) => panic!("rust test binary classified as Go"),
        }
    }
}
