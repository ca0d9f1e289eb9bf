use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use benchtrace_common::KmemLayout;
use log::{debug, warn};

const ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Field offsets of one tracepoint, from its `format` file.
#[derive(Debug, Default)]
pub struct Format {
    offsets: HashMap<String, u32>,
}

impl Format {
    pub fn parse(text: &str) -> Self {
        let mut offsets = HashMap::new();
        for line in text.lines() {
            let mut decl = None;
            let mut offset = None;
            for part in line.split(';').map(str::trim) {
                if let Some(d) = part.strip_prefix("field:") {
                    decl = field_name(d);
                } else if let Some(o) = part.strip_prefix("offset:") {
                    offset = o.parse::<u32>().ok();
                }
            }
            if let (Some(name), Some(offset)) = (decl, offset) {
                offsets.insert(name.to_string(), offset);
            }
        }
        Self { offsets }
    }

    pub fn offset(&self, field: &str) -> Option<u32> {
        self.offsets.get(field).copied()
    }
}

/// `const void * ptr` -> `ptr`, `char comm[16]` -> `comm`.
fn field_name(decl: &str) -> Option<&str> {
    let last = decl.rsplit(|c: char| c.is_whitespace() || c == '*').next()?;
    let name = last.split('[').next()?;
    (!name.is_empty()).then_some(name)
}

pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    pub fn find() -> Option<Self> {
        ROOTS
            .iter()
            .map(Path::new)
            .find(|root| root.join("events").is_dir())
            .map(Self::at)
    }

    pub fn at(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn format(&self, category: &str, event: &str) -> Result<Format> {
        let path = self.root.join("events").join(category).join(event).join("format");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Format::parse(&text))
    }

    /// Overwrite `slot` with the offset of `field`, keeping the default when
    /// the event or field is missing.
    fn refresh(&self, event: &str, field: &str, slot: &mut u32) {
        match self.format("kmem", event).map(|f| f.offset(field)) {
            Ok(Some(offset)) => {
                debug!("kmem:{event} {field} at offset {offset}");
                *slot = offset;
            }
            Ok(None) => warn!("kmem:{event} has no field {field}, keeping offset {slot}"),
            Err(e) => warn!("{e:#}, keeping offset {slot} for kmem:{event} {field}"),
        }
    }

    /// Tracepoint offsets of the running kernel on top of `base`.
    pub fn kmem_layout(&self, base: KmemLayout) -> KmemLayout {
        let mut layout = base;
        self.refresh("kmalloc", "ptr", &mut layout.kmalloc_ptr);
        self.refresh("kmalloc", "bytes_alloc", &mut layout.kmalloc_bytes_alloc);
        self.refresh("kfree", "ptr", &mut layout.kfree_ptr);
        self.refresh("kmem_cache_alloc", "ptr", &mut layout.cache_alloc_ptr);
        self.refresh("kmem_cache_alloc", "bytes_alloc", &mut layout.cache_alloc_bytes_alloc);
        self.refresh("kmem_cache_free", "ptr", &mut layout.cache_free_ptr);
        self.refresh("mm_page_alloc", "pfn", &mut layout.page_alloc_pfn);
        self.refresh("mm_page_alloc", "order", &mut layout.page_alloc_order);
        self.refresh("mm_page_free", "pfn", &mut layout.page_free_pfn);
        layout
    }
}

pub fn page_shift() -> u32 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        (page as u64).trailing_zeros()
    } else {
        KmemLayout::DEFAULT.page_shift
    }
}
