use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use blazesym::{symbolize, symbolize::Symbolizer};
use goblin::elf::{Elf, note::NT_GNU_BUILD_ID};
use log::debug;
use proc_maps::{Pid, get_process_maps};

thread_local! {
    static SYMBOLIZER: Symbolizer = Symbolizer::new();
}

/// One resolved frame; inlined callees follow their caller with `inline` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub addr: u64,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub inline: bool,
}

impl Frame {
    fn raw(addr: u64) -> Self {
        Self {
            addr,
            function: None,
            file: None,
            line: None,
            inline: false,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.inline { "(inlined) " } else { "" };
        match (&self.function, &self.file, self.line) {
            (Some(func), Some(file), Some(line)) => write!(f, "{prefix}{func} at {file}:{line}"),
            (Some(func), _, _) => write!(f, "{prefix}{func}"),
            _ => write!(f, "0x{:x}", self.addr),
        }
    }
}

/// Executable mapping of the target, as read from `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
struct Mapping {
    start: u64,
    end: u64,
    file_offset: u64,
    path: Option<PathBuf>,
}

impl Mapping {
    fn file_offset_of(&self, addr: u64) -> Option<u64> {
        (self.start..self.end)
            .contains(&addr)
            .then(|| addr - self.start + self.file_offset)
    }
}

/// Resolves user addresses of one process. Mappings are captured at
/// construction, so libraries loaded later stay unresolved.
pub struct Resolver {
    mappings: Vec<Mapping>,
}

impl Resolver {
    pub fn new(pid: Pid) -> Result<Self> {
        let mappings = get_process_maps(pid)?
            .into_iter()
            .filter(|m| m.is_exec())
            .map(|m| Mapping {
                start: m.start() as u64,
                end: (m.start() + m.size()) as u64,
                file_offset: m.offset as u64,
                path: m.filename().map(Path::to_path_buf),
            })
            .collect();
        Ok(Self { mappings })
    }

    fn locate(&self, addr: u64) -> Option<(&Path, u64)> {
        self.mappings.iter().find_map(|m| {
            let offset = m.file_offset_of(addr)?;
            Some((m.path.as_deref()?, offset))
        })
    }

    pub fn symbolize_addr(&self, addr: u64) -> Vec<Frame> {
        let Some((path, offset)) = self.locate(addr) else {
            return vec![Frame::raw(addr)];
        };
        let frames = symbolize_elf(path, offset, addr);
        if frames.is_empty() {
            vec![Frame::raw(addr)]
        } else {
            frames
        }
    }

    /// Printable frames, innermost first.
    pub fn describe(&self, addrs: &[u64]) -> Vec<String> {
        addrs
            .iter()
            .flat_map(|&addr| self.symbolize_addr(addr))
            .map(|frame| frame.to_string())
            .collect()
    }
}

pub(crate) fn read_build_id(path: &Path) -> Result<Option<String>> {
    let buf = fs::read(path)?;
    let elf = Elf::parse(&buf)?;

    let sections = elf.iter_note_sections(&buf, Some(".note.gnu.build-id"));
    let headers = elf.iter_note_headers(&buf);
    for notes in sections.into_iter().chain(headers) {
        for note in notes {
            let note = note?;
            if note.name == "GNU" && note.n_type == NT_GNU_BUILD_ID {
                return Ok(Some(hex::encode(note.desc)));
            }
        }
    }
    Ok(None)
}

/// Separate debug info for `original`, by build id first and then by path.
fn find_debug_path(original: &Path) -> Option<PathBuf> {
    if let Ok(Some(build_id)) = read_build_id(original) {
        let (dir, file) = build_id.split_at(2);
        let p = PathBuf::from(format!("/usr/lib/debug/.build-id/{dir}/{file}.debug"));
        if p.is_file() {
            debug!("debug info for {} via build id", original.display());
            return Some(p);
        }
    }

    if original.is_absolute() {
        let p = Path::new("/usr/lib/debug").join(original.strip_prefix("/").ok()?);
        if p.is_file() {
            debug!("debug info for {} via path", original.display());
            return Some(p);
        }
    }

    None
}

fn symbolize_elf(path: &Path, offset: u64, addr: u64) -> Vec<Frame> {
    let direct = symbolize_with_path(path, offset, addr).unwrap_or_default();
    if !direct.is_empty() {
        return direct;
    }
    find_debug_path(path)
        .and_then(|debug| symbolize_with_path(&debug, offset, addr).ok())
        .unwrap_or_default()
}

fn source_path(info: &symbolize::CodeInfo<'_>) -> String {
    let file = Path::new(&info.file);
    info.dir
        .as_ref()
        .map(|d| d.join(file))
        .unwrap_or_else(|| file.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn symbolize_with_path(path: &Path, offset: u64, addr: u64) -> Result<Vec<Frame>> {
    SYMBOLIZER.with(|symbolizer| {
        let src = symbolize::source::Source::Elf(symbolize::source::Elf::new(path));
        let syms = symbolizer
            .symbolize(&src, symbolize::Input::FileOffset(&[offset]))
            .map_err(|e| anyhow!("blazesym: {e}"))?;

        let mut out = Vec::with_capacity(syms.len());
        for sym in syms {
            let symbolize::Symbolized::Sym(s) = sym else {
                continue;
            };
            let file = s.code_info.as_ref().map(|ci| source_path(ci));
            out.push(Frame {
                addr,
                function: Some(s.name.to_string()),
                file: file.clone(),
                line: s.code_info.as_ref().and_then(|ci| ci.line),
                inline: false,
            });
            for inl in s.inlined.iter() {
                out.push(Frame {
                    addr,
                    function: Some(inl.name.to_string()),
                    file: inl.code_info.as_ref().map(|ci| source_path(ci)).or_else(|| file.clone()),
                    line: inl.code_info.as_ref().and_then(|ci| ci.line),
                    inline: true,
                });
            }
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_print_best_available_detail() {
        let mut frame = Frame::raw(0x1234);
        assert_eq!(frame.to_string(), "0x1234");
        frame.function = Some("kv_put".into());
        assert_eq!(frame.to_string(), "kv_put");
        frame.file = Some("src/kv.rs".into());
        frame.line = Some(12);
        frame.inline = true;
        assert_eq!(frame.to_string(), "(inlined) kv_put at src/kv.rs:12");
    }

    #[test]
    fn runtime_address_maps_to_file_offset() {
        let mapping = Mapping {
            start: 0x5000,
            end: 0x9000,
            file_offset: 0x1000,
            path: Some(PathBuf::from("/usr/bin/kv")),
        };
        assert_eq!(mapping.file_offset_of(0x5010), Some(0x1010));
        assert_eq!(mapping.file_offset_of(0x9000), None);

        let resolver = Resolver {
            mappings: vec![mapping],
        };
        let (path, offset) = resolver.locate(0x8fff).unwrap();
        assert_eq!(path, Path::new("/usr/bin/kv"));
        assert_eq!(offset, 0x3fff);
    }

    #[test]
    fn unmapped_addresses_stay_raw() {
        let resolver = Resolver {
            mappings: Vec::new(),
        };
        assert_eq!(resolver.describe(&[0xdead]), vec!["0xdead".to_string()]);
    }

    #[test]
    fn own_process_has_executable_mappings() {
        let resolver = Resolver::new(std::process::id() as Pid).unwrap();
        assert!(!resolver.mappings.is_empty());
    }
}
