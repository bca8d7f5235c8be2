#![allow(dead_code)]

//! Tiny static x86_64 ELF executables carrying a Go build info blob.
//!
//! The binaries are not Go programs; they only look like one to the scanner.
//! Their entry point is a few instructions that exit, hang, crash or write to
//! stderr, which is all the runtime probe needs.

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use fipscheck::HostCapability;
use fipscheck_contracts::DELEGATED_CRYPTO_EXPERIMENT;

const BASE: u64 = 0x40_0000;
const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const SHDR_SIZE: usize = 64;
const CODE_OFF: usize = 0x80;
const BLOB_OFF: usize = 0x200;
const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

#[derive(Debug, Clone)]
pub enum Behavior {
    Exit(u8),
    /// `pause()` in a loop until killed.
    Hang,
    /// Executes `ud2`; dies with SIGILL.
    Crash,
    StderrThenExit(String, u8),
}

#[derive(Debug, Clone)]
pub struct GoFixture {
    pub machine: u16,
    pub go_version: String,
    pub module_path: String,
    pub settings: Vec<(String, String)>,
    pub behavior: Behavior,
    pub with_buildinfo: bool,
}

impl GoFixture {
    /// Built with the delegated crypto experiment and cgo, exits 0.
    pub fn compliant() -> Self {
        GoFixture {
            machine: EM_X86_64,
            go_version: "go1.22.7".to_string(),
            module_path: "example.com/fixture".to_string(),
            settings: vec![
                ("-compiler".to_string(), "gc".to_string()),
                ("CGO_ENABLED".to_string(), "1".to_string()),
                (
                    "GOEXPERIMENT".to_string(),
                    format!("{DELEGATED_CRYPTO_EXPERIMENT},boringcrypto"),
                ),
                ("GOOS".to_string(), "linux".to_string()),
            ],
            behavior: Behavior::Exit(0),
            with_buildinfo: true,
        }
    }

    /// A plain static ELF with no Go build info at all.
    pub fn plain_elf() -> Self {
        GoFixture {
            with_buildinfo: false,
            ..GoFixture::compliant()
        }
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn setting(mut self, key: &str, value: &str) -> Self {
        self.settings.retain(|(k, _)| k != key);
        self.settings.push((key.to_string(), value.to_string()));
        self
    }

    pub fn without_setting(mut self, key: &str) -> Self {
        self.settings.retain(|(k, _)| k != key);
        self
    }

    fn modinfo(&self) -> String {
        let mut text = format!(
            "path\t{}/cmd\nmod\t{}\t(devel)\t\n",
            self.module_path, self.module_path
        );
        text.push_str("dep\tgolang.org/x/sys\tv0.20.0\th1:abc=\n");
        for (k, v) in &self.settings {
            text.push_str(&format!("build\t{k}={v}\n"));
        }
        format!("{}{}{}", "0".repeat(16), text, "1".repeat(16))
    }

    fn code(&self, msg_addr: u64) -> Vec<u8> {
        let exit = |code: u8| {
            let mut c = vec![0xbf];
            c.extend_from_slice(&u32::from(code).to_le_bytes());
            c.extend_from_slice(&[0xb8, 0x3c, 0x00, 0x00, 0x00, 0x0f, 0x05]);
            c
        };
        match &self.behavior {
            Behavior::Exit(code) => exit(*code),
            Behavior::Hang => vec![0xb8, 0x22, 0x00, 0x00, 0x00, 0x0f, 0x05, 0xeb, 0xf7],
            Behavior::Crash => vec![0x0f, 0x0b],
            Behavior::StderrThenExit(msg, code) => {
                let mut c = vec![0xbf, 0x02, 0x00, 0x00, 0x00];
                c.extend_from_slice(&[0x48, 0xbe]);
                c.extend_from_slice(&msg_addr.to_le_bytes());
                c.push(0xba);
                c.extend_from_slice(&(msg.len() as u32).to_le_bytes());
                c.extend_from_slice(&[0xb8, 0x01, 0x00, 0x00, 0x00, 0x0f, 0x05]);
                c.extend(exit(*code));
                c
            }
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let msg: &[u8] = match &self.behavior {
            Behavior::StderrThenExit(m, _) => m.as_bytes(),
            _ => &[],
        };
        let msg_off = 0x140usize;
        assert!(msg_off + msg.len() <= BLOB_OFF, "stderr message too long");

        let mut blob = Vec::new();
        blob.extend_from_slice(b"\xff Go buildinf:");
        blob.push(8);
        blob.push(0x2);
        blob.resize(32, 0);
        push_varint_str(&mut blob, &self.go_version);
        push_varint_str(&mut blob, &self.modinfo());

        let shstrtab: &[u8] = b"\0.go.buildinfo\0.shstrtab\0";
        let blob_len = if self.with_buildinfo { blob.len() } else { 0 };
        let strtab_off = align16(BLOB_OFF + blob_len);
        let shoff = align16(strtab_off + shstrtab.len());
        let shnum: u16 = if self.with_buildinfo { 3 } else { 2 };
        let total = shoff + SHDR_SIZE * shnum as usize;

        let mut out = vec![0u8; total];
        // ELF header
        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        put_u16(&mut out, 16, 2);
        put_u16(&mut out, 18, self.machine);
        put_u32(&mut out, 20, 1);
        put_u64(&mut out, 24, BASE + CODE_OFF as u64);
        put_u64(&mut out, 32, EHDR_SIZE as u64);
        put_u64(&mut out, 40, shoff as u64);
        put_u16(&mut out, 52, EHDR_SIZE as u16);
        put_u16(&mut out, 54, PHDR_SIZE as u16);
        put_u16(&mut out, 56, 1);
        put_u16(&mut out, 58, SHDR_SIZE as u16);
        put_u16(&mut out, 60, shnum);
        put_u16(&mut out, 62, shnum - 1);

        // One R+X load segment covering the whole file.
        let ph = EHDR_SIZE;
        put_u32(&mut out, ph, 1);
        put_u32(&mut out, ph + 4, 5);
        put_u64(&mut out, ph + 8, 0);
        put_u64(&mut out, ph + 16, BASE);
        put_u64(&mut out, ph + 24, BASE);
        put_u64(&mut out, ph + 32, total as u64);
        put_u64(&mut out, ph + 40, total as u64);
        put_u64(&mut out, ph + 48, 0x1000);

        let code = self.code(BASE + msg_off as u64);
        assert!(CODE_OFF + code.len() <= msg_off);
        out[CODE_OFF..CODE_OFF + code.len()].copy_from_slice(&code);
        out[msg_off..msg_off + msg.len()].copy_from_slice(msg);
        if self.with_buildinfo {
            out[BLOB_OFF..BLOB_OFF + blob.len()].copy_from_slice(&blob);
        }
        out[strtab_off..strtab_off + shstrtab.len()].copy_from_slice(shstrtab);

        // Section 0 stays zeroed.
        let mut idx = 1;
        if self.with_buildinfo {
            let sh = shoff + SHDR_SIZE * idx;
            put_u32(&mut out, sh, 1);
            put_u32(&mut out, sh + 4, 1);
            put_u64(&mut out, sh + 8, 3);
            put_u64(&mut out, sh + 16, BASE + BLOB_OFF as u64);
            put_u64(&mut out, sh + 24, BLOB_OFF as u64);
            put_u64(&mut out, sh + 32, blob.len() as u64);
            put_u64(&mut out, sh + 48, 16);
            idx += 1;
        }
        let sh = shoff + SHDR_SIZE * idx;
        put_u32(&mut out, sh, 15);
        put_u32(&mut out, sh + 4, 3);
        put_u64(&mut out, sh + 24, strtab_off as u64);
        put_u64(&mut out, sh + 32, shstrtab.len() as u64);
        put_u64(&mut out, sh + 48, 1);
        out
    }

    pub fn write(&self, path: &Path) -> PathBuf {
        write_executable(path, &self.bytes());
        path.to_path_buf()
    }
}

pub fn write_executable(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dir");
    }
    std::fs::write(path, bytes).expect("write fixture");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

pub fn write_script(path: &Path, body: &str) {
    write_executable(path, format!("#!/bin/sh\n{body}\n").as_bytes());
}

pub fn capable_host() -> HostCapability {
    HostCapability {
        library_version: "OpenSSL 3.0.13 30 Jan 2024 (fixture)".to_string(),
        fips_capable: true,
        diagnostic: None,
    }
}

/// Live processes whose executable sits under `dir`.
pub fn live_processes_under(dir: &Path) -> Vec<u32> {
    let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            std::fs::read_link(format!("/proc/{pid}/exe"))
                .map(|exe| exe.starts_with(&dir))
                .unwrap_or(false)
        })
        .collect()
}

fn push_varint_str(out: &mut Vec<u8>, s: &str) {
    let mut n = s.len() as u64;
    while n >= 0x80 {
        out.push((n as u8 & 0x7f) | 0x80);
        n >>= 7;
    }
    out.push(n as u8);
    out.extend_from_slice(s.as_bytes());
}

fn align16(n: usize) -> usize {
    (n + 15) & !15
}

fn put_u16(out: &mut [u8], at: usize, v: u16) {
    out[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, v: u32) {
    out[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, v: u64) {
    out[at..at + 8].copy_from_slice(&v.to_le_bytes());
}
