//! Go build info: locating the `\xff Go buildinf:` blob and decoding it into
//! [`BuildMetadata`].
//!
//! Two on-disk layouts exist. Go 1.18+ writes the version and module info as
//! varint-prefixed strings right after the 32-byte header (flag bit 1). Older
//! toolchains store two pointers to Go string headers, resolved through the
//! loadable segments. The module info text is the `runtime/debug` format:
//!
//! ```text
//! path    example.com/cmd/app
//! mod     example.com  v1.2.3  h1:...
//! dep     golang.org/x/sys  v0.1.0  h1:...
//! build   CGO_ENABLED=1
//! build   GOEXPERIMENT=systemcrypto
//! ```

use std::collections::BTreeMap;
use std::fs::File;

use serde::Serialize;

use crate::elf::{read_exact_at, ByteOrder, ElfError, ElfFile};

pub const BUILDINFO_MAGIC: &[u8; 14] = b"\xff Go buildinf:";
pub const BUILDINFO_SECTION: &str = ".go.buildinfo";

const HEADER_SIZE: usize = 32;
const ALIGN: usize = 16;
const SEARCH_WINDOW: u64 = 64 * 1024;
const FLAG_BIG_ENDIAN: u8 = 0x1;
const FLAG_VERSION_INLINE: u8 = 0x2;
const MAX_STRING_LEN: u64 = 1 << 20;
const MAX_VARINT_LEN: usize = 10;

pub const SETTING_EXPERIMENT: &str = "GOEXPERIMENT";
pub const SETTING_CGO: &str = "CGO_ENABLED";

#[derive(Debug, thiserror::Error)]
pub enum BuildInfoError {
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("build info header: {0}")]
    Header(String),
    #[error("build info string: {0}")]
    String(String),
    #[error("module info line {line}: {reason}")]
    ModInfo { line: usize, reason: String },
}

/// Where the build info header lives in the file, as found by [`locate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfoHeader {
    pub offset: u64,
    pub ptr_size: u8,
    pub flags: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleRef {
    pub path: String,
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace: Option<Box<ModuleRef>>,
}

/// Parsed `runtime/debug` module info.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModInfo {
    pub go_version: Option<String>,
    pub path: String,
    pub main: ModuleRef,
    pub deps: Vec<ModuleRef>,
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildMetadata {
    pub go_version: String,
    /// Main module path; empty when the binary carries no module info.
    pub module_path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub module_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub package_path: String,
    pub native_interop_enabled: bool,
    pub uses_delegated_crypto: bool,
    pub experiments: Vec<String>,
    pub settings: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<ModuleRef>,
}

impl BuildMetadata {
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

/// Finds the 16-byte aligned magic inside the `.go.buildinfo` section, or in the
/// first writable non-executable segment when the section table is stripped.
pub fn locate(file: &File, elf: &ElfFile) -> Result<Option<BuildInfoHeader>, BuildInfoError> {
    let (start, len) = if let Some(sec) = elf.section(BUILDINFO_SECTION) {
        (sec.offset, sec.size)
    } else if let Some(seg) = elf.data_segment() {
        (seg.offset, seg.filesz)
    } else {
        return Ok(None);
    };

    let avail = elf.file_len.saturating_sub(start);
    let window = len.min(SEARCH_WINDOW).min(avail) as usize;
    if window < HEADER_SIZE {
        return Ok(None);
    }
    let data = read_exact_at(file, start, window)?;
    let Some(pos) = find_aligned_magic(&data) else {
        return Ok(None);
    };

    let ptr_size = data[pos + BUILDINFO_MAGIC.len()];
    let flags = data[pos + BUILDINFO_MAGIC.len() + 1];
    let offset = start
        .checked_add(pos as u64)
        .ok_or_else(|| BuildInfoError::Header("offset out of range".to_string()))?;
    Ok(Some(BuildInfoHeader {
        offset,
        ptr_size,
        flags,
    }))
}

fn find_aligned_magic(data: &[u8]) -> Option<usize> {
    let mut pos = 0usize;
    while pos + HEADER_SIZE <= data.len() {
        if data[pos..].starts_with(BUILDINFO_MAGIC) {
            return Some(pos);
        }
        pos += ALIGN;
    }
    None
}

/// Reads the Go version and raw module info string behind a located header.
pub fn read_raw(
    file: &File,
    elf: &ElfFile,
    header: &BuildInfoHeader,
) -> Result<(String, String), BuildInfoError> {
    let past = |n: u64| {
        header
            .offset
            .checked_add(n)
            .ok_or_else(|| BuildInfoError::Header("offset out of range".to_string()))
    };
    if header.flags & FLAG_VERSION_INLINE != 0 {
        let mut pos = past(HEADER_SIZE as u64)?;
        let version = read_varint_string(file, elf, &mut pos)?;
        let modinfo = read_varint_string(file, elf, &mut pos)?;
        return Ok((version, modinfo));
    }

    let ptr_size = header.ptr_size as usize;
    if ptr_size != 4 && ptr_size != 8 {
        return Err(BuildInfoError::Header(format!(
            "unsupported pointer size {ptr_size}"
        )));
    }
    let order = if header.flags & FLAG_BIG_ENDIAN != 0 {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };
    let ptrs = read_exact_at(file, past(16)?, ptr_size * 2)?;
    let version_ptr = order.word(&ptrs, ptr_size);
    let modinfo_ptr = order.word(&ptrs[ptr_size..], ptr_size);
    let version = read_string_header(file, elf, order, ptr_size, version_ptr)?;
    let modinfo = read_string_header(file, elf, order, ptr_size, modinfo_ptr)?;
    Ok((version, modinfo))
}

fn read_varint_string(
    file: &File,
    elf: &ElfFile,
    pos: &mut u64,
) -> Result<String, BuildInfoError> {
    let avail = elf.file_len.saturating_sub(*pos);
    let peek = (MAX_VARINT_LEN as u64).min(avail) as usize;
    let head = read_exact_at(file, *pos, peek)?;
    let (len, used) = decode_uvarint(&head)
        .ok_or_else(|| BuildInfoError::String("bad length varint".to_string()))?;
    if len > MAX_STRING_LEN {
        return Err(BuildInfoError::String(format!("length {len} too large")));
    }
    let start = pos
        .checked_add(used as u64)
        .ok_or_else(|| BuildInfoError::String("offset out of range".to_string()))?;
    if elf.file_len.saturating_sub(start) < len {
        return Err(BuildInfoError::String("string data truncated".to_string()));
    }
    let bytes = read_exact_at(file, start, len as usize)?;
    *pos = start + len;
    String::from_utf8(bytes).map_err(|_| BuildInfoError::String("not UTF-8".to_string()))
}

fn read_string_header(
    file: &File,
    elf: &ElfFile,
    order: ByteOrder,
    ptr_size: usize,
    addr: u64,
) -> Result<String, BuildInfoError> {
    let (hdr_off, hdr_avail) = elf
        .offset_for_vaddr(addr)
        .ok_or_else(|| BuildInfoError::String(format!("unmapped address {addr:#x}")))?;
    if hdr_avail < (ptr_size * 2) as u64 {
        return Err(BuildInfoError::String("string header truncated".to_string()));
    }
    let hdr = read_exact_at(file, hdr_off, ptr_size * 2)?;
    let data_addr = order.word(&hdr, ptr_size);
    let len = order.word(&hdr[ptr_size..], ptr_size);
    if len == 0 {
        return Ok(String::new());
    }
    if len > MAX_STRING_LEN {
        return Err(BuildInfoError::String(format!("length {len} too large")));
    }
    let (data_off, data_avail) = elf
        .offset_for_vaddr(data_addr)
        .ok_or_else(|| BuildInfoError::String(format!("unmapped address {data_addr:#x}")))?;
    if data_avail < len {
        return Err(BuildInfoError::String("string data truncated".to_string()));
    }
    let bytes = read_exact_at(file, data_off, len as usize)?;
    String::from_utf8(bytes).map_err(|_| BuildInfoError::String("not UTF-8".to_string()))
}

pub fn decode_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None;
            }
            return Some((x | (u64::from(b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    None
}

/// Removes the 16-byte sentinels the linker wraps around module info.
/// Returns an empty string when the sentinels are absent.
pub fn strip_modinfo_sentinels(raw: &str) -> &str {
    let b = raw.as_bytes();
    if b.len() >= 33 && b[b.len() - 17] == b'\n' {
        raw.get(16..raw.len() - 16).unwrap_or("")
    } else {
        ""
    }
}

pub fn parse_modinfo(text: &str) -> Result<ModInfo, BuildInfoError> {
    let mut info = ModInfo::default();
    let mut last_dep_replaced = true;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let err = |reason: &str| BuildInfoError::ModInfo {
            line: line_no,
            reason: reason.to_string(),
        };
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("go\t") {
            info.go_version = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("path\t") {
            info.path = rest.to_string();
        } else if let Some(rest) = line.strip_prefix("mod\t") {
            info.main = parse_module(rest).ok_or_else(|| err("malformed mod line"))?;
        } else if let Some(rest) = line.strip_prefix("dep\t") {
            info.deps
                .push(parse_module(rest).ok_or_else(|| err("malformed dep line"))?);
            last_dep_replaced = false;
        } else if let Some(rest) = line.strip_prefix("=>\t") {
            let repl = parse_module(rest).ok_or_else(|| err("malformed replacement"))?;
            let last = match info.deps.last_mut() {
                Some(dep) if !last_dep_replaced => dep,
                _ => return Err(err("replacement with no module on previous line")),
            };
            last.replace = Some(Box::new(repl));
            last_dep_replaced = true;
        } else if let Some(rest) = line.strip_prefix("build\t") {
            let (key, value) = parse_build_setting(rest).map_err(|r| err(r.as_str()))?;
            info.settings.insert(key, value);
        }
    }

    Ok(info)
}

fn parse_module(rest: &str) -> Option<ModuleRef> {
    let mut fields = rest.split('\t');
    let path = fields.next().filter(|p| !p.is_empty())?;
    let version = fields.next().unwrap_or("");
    let sum = fields.next().unwrap_or("");
    Some(ModuleRef {
        path: path.to_string(),
        version: version.to_string(),
        sum: sum.to_string(),
        replace: None,
    })
}

fn parse_build_setting(kv: &str) -> Result<(String, String), String> {
    let (key, raw_value) = match kv.as_bytes().first() {
        None => return Err("build line missing '='".to_string()),
        Some(b'=') => return Err("build line with missing key".to_string()),
        Some(b'"') | Some(b'`') => {
            let (key, used) = unquote_prefix(kv).ok_or("invalid quoted key")?;
            let rest = &kv[used..];
            let raw = rest
                .strip_prefix('=')
                .ok_or("build line missing '=' after quoted key")?;
            (key, raw)
        }
        Some(_) => {
            let (k, v) = kv.split_once('=').ok_or("build line missing '='")?;
            (k.to_string(), v)
        }
    };

    let value = match raw_value.as_bytes().first() {
        Some(b'"') | Some(b'`') => match unquote_prefix(raw_value) {
            Some((v, used)) if used == raw_value.len() => v,
            _ => return Err("invalid quoted value".to_string()),
        },
        _ => raw_value.to_string(),
    };
    Ok((key, value))
}

/// Decodes a Go-quoted string at the start of `s`, returning the value and the
/// number of bytes consumed.
fn unquote_prefix(s: &str) -> Option<(String, usize)> {
    let mut chars = s.char_indices();
    let (_, quote) = chars.next()?;
    if quote == '`' {
        let end = s[1..].find('`')?;
        return Some((s[1..1 + end].to_string(), end + 2));
    }
    if quote != '"' {
        return None;
    }

    let mut out = String::new();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, i + 1)),
            '\\' => {
                let (_, e) = chars.next()?;
                match e {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'a' => out.push('\u{7}'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'v' => out.push('\u{b}'),
                    '\\' => out.push('\\'),
                    '"' => out.push('"'),
                    '\'' => out.push('\''),
                    'x' | 'u' | 'U' => {
                        let n = match e {
                            'x' => 2,
                            'u' => 4,
                            _ => 8,
                        };
                        let mut hex = String::with_capacity(n);
                        for _ in 0..n {
                            hex.push(chars.next()?.1);
                        }
                        let v = u32::from_str_radix(&hex, 16).ok()?;
                        out.push(char::from_u32(v)?);
                    }
                    '0'..='7' => {
                        let mut oct = String::from(e);
                        for _ in 0..2 {
                            oct.push(chars.next()?.1);
                        }
                        let v = u32::from_str_radix(&oct, 8).ok()?;
                        out.push(char::from_u32(v)?);
                    }
                    _ => return None,
                }
            }
            '\n' => return None,
            c => out.push(c),
        }
    }
    None
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

/// Builds the metadata view from the decoded strings.
pub fn metadata_from_raw(
    go_version: &str,
    raw_modinfo: &str,
    crypto_experiment: &str,
) -> Result<BuildMetadata, BuildInfoError> {
    if go_version.is_empty() {
        return Err(BuildInfoError::String("empty Go version".to_string()));
    }
    let info = parse_modinfo(strip_modinfo_sentinels(raw_modinfo))?;

    let experiments: Vec<String> = info
        .settings
        .get(SETTING_EXPERIMENT)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let uses_delegated_crypto = experiments.iter().any(|t| t == crypto_experiment);
    let native_interop_enabled = info.settings.get(SETTING_CGO).is_some_and(|v| truthy(v));

    Ok(BuildMetadata {
        go_version: go_version.to_string(),
        module_path: info.main.path.clone(),
        module_version: info.main.version.clone(),
        package_path: info.path,
        native_interop_enabled,
        uses_delegated_crypto,
        experiments,
        settings: info.settings,
        deps: info.deps,
    })
}

/// Decodes build metadata behind an already located header. Never executes the binary.
pub fn extract(
    file: &File,
    elf: &ElfFile,
    header: &BuildInfoHeader,
    crypto_experiment: &str,
) -> Result<BuildMetadata, BuildInfoError> {
    let (version, modinfo) = read_raw(file, elf, header)?;
    metadata_from_raw(&version, &modinfo, crypto_experiment)
}
