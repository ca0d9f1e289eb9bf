use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use benchtrace_common::{capacity, names};

/// Options of `benchtrace trace`.
#[derive(Debug, Clone, clap::Args)]
pub struct TraceConfig {
    /// Process to trace
    #[arg(short, long)]
    pub pid: u32,

    /// Seconds to trace; 0 runs until Ctrl-C
    #[arg(short, long, default_value = "10")]
    pub duration: u64,

    /// Milliseconds between drains of the kernel tables
    #[arg(long, default_value = "200")]
    pub interval_ms: u64,

    /// Attach the allocator probes (libc uprobes and kmem tracepoints)
    #[arg(long)]
    pub memory: bool,

    /// Count kernel slab cache traffic per cache name
    #[arg(long)]
    pub slab_caches: bool,

    /// Skip slab caches whose slots (object plus metadata) are smaller than this many bytes
    #[arg(long, default_value = "0")]
    pub min_cache_object_size: u64,

    /// Count pairing anomalies (reentrant syscalls, unmatched exits, untracked frees)
    #[arg(long)]
    pub diagnostics: bool,

    /// Binary carrying the phase markers; defaults to this executable
    #[arg(long)]
    pub phase_binary: Option<PathBuf>,

    #[arg(long, default_value = "benchtrace_phase_start")]
    pub phase_start: String,

    #[arg(long, default_value = "benchtrace_phase_end")]
    pub phase_end: String,

    /// Kernel function probed for slab cache allocations
    #[arg(long, default_value = "kmem_cache_alloc")]
    pub cache_alloc_symbol: String,

    /// Kernel function probed for slab cache frees
    #[arg(long, default_value = "kmem_cache_free")]
    pub cache_free_symbol: String,

    /// Offset of `size` (the slot size, metadata included) in `struct kmem_cache`
    #[arg(long)]
    pub kmem_cache_size_offset: Option<u32>,

    /// Offset of `name` in `struct kmem_cache`
    #[arg(long)]
    pub kmem_cache_name_offset: Option<u32>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Number of leaking stacks to symbolize
    #[arg(long, default_value = "20")]
    pub top: usize,

    #[command(flatten)]
    pub capacities: Capacities,
}

/// Table sizes handed to the loader.
#[derive(Debug, Clone, clap::Args)]
pub struct Capacities {
    #[arg(long = "max-stacks", default_value_t = capacity::STACKS)]
    pub stacks: u32,
    #[arg(long = "max-phase-ring", default_value_t = capacity::PHASES)]
    pub phase_ring: u32,
    #[arg(long = "max-thread-ring", default_value_t = capacity::THREADS)]
    pub thread_ring: u32,
    #[arg(long = "max-pending-syscalls", default_value_t = capacity::PENDING_SYSCALLS)]
    pub pending_syscalls: u32,
    #[arg(long = "max-syscall-ring", default_value_t = capacity::SYSCALLS)]
    pub syscall_ring: u32,
    #[arg(long = "max-pending-sizes", default_value_t = capacity::PENDING_SIZES)]
    pub pending_sizes: u32,
    #[arg(long = "max-pending-memptrs", default_value_t = capacity::PENDING_MEMPTRS)]
    pub pending_memptrs: u32,
    #[arg(long = "max-allocs", default_value_t = capacity::ALLOCS)]
    pub allocs: u32,
    #[arg(long = "max-combined-allocs", default_value_t = capacity::COMBINED_ALLOCS)]
    pub combined_allocs: u32,
    #[arg(long = "max-kernel-caches", default_value_t = capacity::KERNEL_CACHES)]
    pub kernel_caches: u32,
}

impl Capacities {
    /// `(map name, max entries)` for every sized map in the object.
    pub fn by_map(&self) -> [(&'static str, u32); 10] {
        [
            (names::STACKS, self.stacks),
            (names::PHASES, self.phase_ring),
            (names::THREADS, self.thread_ring),
            (names::SYSCALL_START, self.pending_syscalls),
            (names::SYSCALLS, self.syscall_ring),
            (names::SIZES, self.pending_sizes),
            (names::MEMPTRS, self.pending_memptrs),
            (names::ALLOCS, self.allocs),
            (names::COMBINED_ALLOCS, self.combined_allocs),
            (names::KERNEL_CACHES, self.kernel_caches),
        ]
    }
}

impl TraceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pid == 0 {
            bail!("--pid must name a running process, not 0");
        }
        if self.interval_ms == 0 {
            bail!("--interval-ms must be positive");
        }
        if self.phase_start.is_empty() || self.phase_end.is_empty() {
            bail!("phase marker symbols must not be empty");
        }
        for (map, entries) in self.capacities.by_map() {
            if entries == 0 {
                bail!("capacity of {map} must be positive");
            }
        }
        Ok(())
    }

    /// `None` when tracing runs until interrupted.
    pub fn run_for(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn phase_binary(&self) -> Result<PathBuf> {
        match &self.phase_binary {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        trace: TraceConfig,
    }

    fn parse(args: &[&str]) -> TraceConfig {
        let argv = std::iter::once("benchtrace").chain(args.iter().copied());
        Cli::try_parse_from(argv).unwrap().trace
    }

    #[test]
    fn defaults_match_compiled_capacities() {
        let config = parse(&["--pid", "42"]);
        assert_eq!(config.pid, 42);
        assert_eq!(config.duration, 10);
        assert_eq!(config.phase_start, "benchtrace_phase_start");
        assert_eq!(config.capacities.allocs, capacity::ALLOCS);
        assert_eq!(config.capacities.syscall_ring, capacity::SYSCALLS);
        assert!(!config.memory);
        config.validate().unwrap();
    }

    #[test]
    fn capacity_overrides_reach_the_map_list() {
        let config = parse(&["--pid", "1", "--max-allocs", "64", "--max-stacks", "8"]);
        let by_map = config.capacities.by_map();
        assert!(by_map.contains(&(names::ALLOCS, 64)));
        assert!(by_map.contains(&(names::STACKS, 8)));
    }

    #[test]
    fn zero_pid_is_rejected() {
        assert!(parse(&["--pid", "0"]).validate().is_err());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = parse(&["--pid", "7", "--max-pending-sizes", "0"]).validate().unwrap_err();
        assert!(err.to_string().contains(names::SIZES));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(parse(&["--pid", "7", "--interval-ms", "0"]).validate().is_err());
    }

    #[test]
    fn zero_duration_runs_until_interrupted() {
        assert_eq!(parse(&["--pid", "7", "--duration", "0"]).run_for(), None);
        assert_eq!(
            parse(&["--pid", "7", "-d", "3"]).run_for(),
            Some(Duration::from_secs(3))
        );
    }
}
