use anyhow::{Context as _, Result, anyhow};
use aya::{
    Ebpf,
    programs::{KProbe, TracePoint, UProbe},
};
use log::{debug, info, warn};

use crate::config::TraceConfig;

const SYSCALL_TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("sys_enter", "raw_syscalls", "sys_enter"),
    ("sys_exit", "raw_syscalls", "sys_exit"),
];

const THREAD_TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("clone_exit", "syscalls", "sys_exit_clone"),
    ("process_exit", "sched", "sched_process_exit"),
];

// clone3 is missing on older kernels.
const OPTIONAL_THREAD_TRACEPOINTS: &[(&str, &str, &str)] =
    &[("clone_exit", "syscalls", "sys_exit_clone3")];

const KMEM_TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("kmalloc", "kmem", "kmalloc"),
    ("kfree", "kmem", "kfree"),
    ("kmem_cache_alloc", "kmem", "kmem_cache_alloc"),
    ("kmem_cache_free", "kmem", "kmem_cache_free"),
    ("mm_page_alloc", "kmem", "mm_page_alloc"),
    ("mm_page_free", "kmem", "mm_page_free"),
];

/// (program, libc symbol). Entry and return probes of one function share a row each.
const LIBC_PROBES: &[(&str, &str)] = &[
    ("alloc_enter", "malloc"),
    ("alloc_exit", "malloc"),
    ("calloc_enter", "calloc"),
    ("alloc_exit", "calloc"),
    ("realloc_enter", "realloc"),
    ("alloc_exit", "realloc"),
    ("free_enter", "free"),
    ("alloc_enter_arg1", "mmap"),
    ("mmap_exit", "mmap"),
    ("free_enter", "munmap"),
    ("posix_memalign_enter", "posix_memalign"),
    ("posix_memalign_exit", "posix_memalign"),
    ("alloc_enter_arg1", "aligned_alloc"),
    ("alloc_exit", "aligned_alloc"),
    ("alloc_enter", "valloc"),
    ("alloc_exit", "valloc"),
    ("alloc_enter_arg1", "memalign"),
    ("alloc_exit", "memalign"),
    ("alloc_enter", "pvalloc"),
    ("alloc_exit", "pvalloc"),
];

#[derive(Debug, Default)]
pub struct AttachStats {
    pub tracepoints: u32,
    pub uprobes: u32,
    pub kprobes: u32,
    pub failed: u32,
}

impl AttachStats {
    pub fn log(&self) {
        info!(
            "attached {} tracepoints, {} uprobes, {} kprobes; {} optional probes skipped",
            self.tracepoints, self.uprobes, self.kprobes, self.failed
        );
    }
}

/// Attaches programs of one loaded object. Each program is loaded on first
/// use and may then be attached to several targets.
pub struct Attacher<'a> {
    ebpf: &'a mut Ebpf,
    pid: i32,
    stats: AttachStats,
}

impl<'a> Attacher<'a> {
    pub fn new(ebpf: &'a mut Ebpf, pid: u32) -> Self {
        Self {
            ebpf,
            pid: pid as i32,
            stats: AttachStats::default(),
        }
    }

    fn tracepoint(&mut self, prog: &str, category: &str, name: &str) -> Result<()> {
        let program: &mut TracePoint = self
            .ebpf
            .program_mut(prog)
            .ok_or_else(|| anyhow!("program {prog} not found"))?
            .try_into()?;
        if program.fd().is_err() {
            program.load()?;
        }
        program.attach(category, name)?;
        self.stats.tracepoints += 1;
        debug!("attached {prog} to {category}:{name}");
        Ok(())
    }

    fn uprobe(&mut self, prog: &str, target: &str, symbol: &str) -> Result<()> {
        let pid = self.pid;
        let program: &mut UProbe = self
            .ebpf
            .program_mut(prog)
            .ok_or_else(|| anyhow!("program {prog} not found"))?
            .try_into()?;
        if program.fd().is_err() {
            program.load()?;
        }
        program.attach(Some(symbol), 0, target, Some(pid))?;
        self.stats.uprobes += 1;
        debug!("attached {prog} to {target}:{symbol}");
        Ok(())
    }

    fn kprobe(&mut self, prog: &str, symbol: &str) -> Result<()> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(prog)
            .ok_or_else(|| anyhow!("program {prog} not found"))?
            .try_into()?;
        if program.fd().is_err() {
            program.load()?;
        }
        program.attach(symbol, 0)?;
        self.stats.kprobes += 1;
        debug!("attached {prog} to {symbol}");
        Ok(())
    }

    fn optional(&mut self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            self.stats.failed += 1;
            warn!("skipping {what}: {e:#}");
        }
    }

    pub fn attach_all(mut self, config: &TraceConfig) -> Result<AttachStats> {
        for &(prog, category, name) in SYSCALL_TRACEPOINTS.iter().chain(THREAD_TRACEPOINTS) {
            self.tracepoint(prog, category, name)
                .with_context(|| format!("attaching {category}:{name}"))?;
        }
        for &(prog, category, name) in OPTIONAL_THREAD_TRACEPOINTS {
            let result = self.tracepoint(prog, category, name);
            self.optional(&format!("{category}:{name}"), result);
        }

        let binary = config.phase_binary()?;
        let binary = binary.to_string_lossy();
        let markers = [
            ("phase_start", &config.phase_start),
            ("phase_end", &config.phase_end),
        ];
        for (prog, symbol) in markers {
            let result = self.uprobe(prog, &binary, symbol);
            self.optional(&format!("phase marker {binary}:{symbol}"), result);
        }

        if config.memory {
            for &(prog, symbol) in LIBC_PROBES {
                let result = self.uprobe(prog, "libc", symbol);
                self.optional(&format!("{prog} on libc:{symbol}"), result);
            }
            for &(prog, category, name) in KMEM_TRACEPOINTS {
                let result = self.tracepoint(prog, category, name);
                self.optional(&format!("{category}:{name}"), result);
            }
        }

        if config.slab_caches {
            for (prog, symbol) in [
                ("cache_alloc", &config.cache_alloc_symbol),
                ("cache_free", &config.cache_free_symbol),
            ] {
                let result = self.kprobe(prog, symbol);
                self.optional(&format!("kprobe {symbol}"), result);
            }
        }

        Ok(self.stats)
    }
}
