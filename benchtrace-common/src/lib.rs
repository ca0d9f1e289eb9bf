#![cfg_attr(not(test), no_std)]

pub mod probe;

use bytemuck::{Pod, Zeroable};

/// Identifier handed out by the stack table for one distinct user stack.
pub type StackId = i64;

/// Marker for records whose stack could not be interned.
pub const UNKNOWN_STACK: StackId = -1;

pub const CACHE_NAME_LEN: usize = 32;

/// Default table sizes. Every one of them can be overridden at load time.
pub mod capacity {
    pub const STACKS: u32 = 50_000;
    pub const PHASES: u32 = 1_024;
    pub const THREADS: u32 = 4_096;
    pub const PENDING_SYSCALLS: u32 = 10_000;
    pub const SYSCALLS: u32 = 2_000_000;
    pub const PENDING_SIZES: u32 = 10_000;
    pub const PENDING_MEMPTRS: u32 = 10_000;
    pub const ALLOCS: u32 = 1_000_000;
    pub const COMBINED_ALLOCS: u32 = 100_000;
    pub const KERNEL_CACHES: u32 = 1_024;
}

/// Names of the maps and globals in the eBPF object.
pub mod names {
    pub const STACKS: &str = "STACKS";
    pub const PHASES: &str = "PHASES";
    pub const THREADS: &str = "THREADS";
    pub const SYSCALL_START: &str = "SYSCALL_START";
    pub const SYSCALLS: &str = "SYSCALLS";
    pub const SIZES: &str = "SIZES";
    pub const MEMPTRS: &str = "MEMPTRS";
    pub const ALLOCS: &str = "ALLOCS";
    pub const COMBINED_ALLOCS: &str = "COMBINED_ALLOCS";
    pub const KERNEL_CACHES: &str = "KERNEL_CACHES";
    pub const ANOMALIES: &str = "ANOMALIES";

    pub const TARGET_PID: &str = "TARGET_PID";
    pub const MIN_CACHE_OBJECT_SIZE: &str = "MIN_CACHE_OBJECT_SIZE";
    pub const DIAGNOSTICS_ENABLED: &str = "DIAGNOSTICS_ENABLED";
    pub const KMEM_LAYOUT: &str = "KMEM_LAYOUT";
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
}

impl Phase {
    const fn raw(self) -> u8 {
        match self {
            Phase::Start => 1,
            Phase::End => 0,
        }
    }

    const fn from_raw(raw: u8) -> Self {
        if raw == 0 { Phase::End } else { Phase::Start }
    }
}

/// Benchmark phase boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PhaseEvent {
    pub timestamp_ns: u64,
    pub thread_id: u32,
    pub phase: u8,
    pub _pad: [u8; 3],
}

impl PhaseEvent {
    pub fn new(timestamp_ns: u64, thread_id: u32, phase: Phase) -> Self {
        Self {
            timestamp_ns,
            thread_id,
            phase: phase.raw(),
            _pad: [0; 3],
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase)
    }
}

/// Thread creation (`Start`, stack of the spawning call) or termination (`End`).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ThreadRecord {
    pub timestamp_ns: u64,
    pub thread_id: u32,
    pub phase: u8,
    pub _pad: [u8; 3],
    pub stack_id: StackId,
}

impl ThreadRecord {
    pub fn new(timestamp_ns: u64, thread_id: u32, phase: Phase, stack_id: StackId) -> Self {
        Self {
            timestamp_ns,
            thread_id,
            phase: phase.raw(),
            _pad: [0; 3],
            stack_id,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase)
    }

    pub fn stack(&self) -> Option<StackId> {
        (self.stack_id != UNKNOWN_STACK).then_some(self.stack_id)
    }
}

/// One completed syscall.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct SyscallRecord {
    pub syscall_id: i64,
    pub stack_id: StackId,
    pub pid_tgid: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl SyscallRecord {
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Ledger entry for an allocation still waiting for its free.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocInfo {
    pub size: u64,
    pub timestamp_ns: u64,
    pub stack_id: StackId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Side {
    Alloc,
    Free,
}

/// Running totals for one stack id or one kernel cache. Never reset during a run.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AllocStats {
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

impl AllocStats {
    /// Pointers to the byte total and the event count of `side`.
    ///
    /// # Safety
    ///
    /// `this` must point at a live `AllocStats`.
    #[inline(always)]
    pub unsafe fn side_ptrs(this: *mut Self, side: Side) -> (*mut u64, *mut u64) {
        unsafe {
            match side {
                Side::Alloc => (
                    core::ptr::addr_of_mut!((*this).alloc_bytes),
                    core::ptr::addr_of_mut!((*this).alloc_count),
                ),
                Side::Free => (
                    core::ptr::addr_of_mut!((*this).free_bytes),
                    core::ptr::addr_of_mut!((*this).free_count),
                ),
            }
        }
    }

    /// Bytes allocated from this site that have not been seen freed.
    pub fn live_bytes(&self) -> i64 {
        self.alloc_bytes as i64 - self.free_bytes as i64
    }

    pub fn live_count(&self) -> i64 {
        self.alloc_count as i64 - self.free_count as i64
    }
}

/// NUL padded slab cache name.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct CacheName {
    pub name: [u8; CACHE_NAME_LEN],
}

impl CacheName {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = [0u8; CACHE_NAME_LEN];
        let len = bytes.len().min(CACHE_NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        Self { name }
    }

    pub fn as_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(CACHE_NAME_LEN);
        &self.name[..len]
    }
}

/// Field offsets of the kmem tracepoints and of `struct kmem_cache`.
///
/// Tracepoint offsets are refreshed from tracefs at attach time; the
/// `kmem_cache` ones have no such source and default to a 64-bit SLUB layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct KmemLayout {
    pub kmalloc_ptr: u32,
    pub kmalloc_bytes_alloc: u32,
    pub kfree_ptr: u32,
    pub cache_alloc_ptr: u32,
    pub cache_alloc_bytes_alloc: u32,
    pub cache_free_ptr: u32,
    pub page_alloc_pfn: u32,
    pub page_alloc_order: u32,
    pub page_free_pfn: u32,
    pub page_shift: u32,
    pub kmem_cache_size: u32,
    pub kmem_cache_name: u32,
}

impl KmemLayout {
    pub const DEFAULT: Self = Self {
        kmalloc_ptr: 16,
        kmalloc_bytes_alloc: 32,
        kfree_ptr: 16,
        cache_alloc_ptr: 16,
        cache_alloc_bytes_alloc: 32,
        cache_free_ptr: 16,
        page_alloc_pfn: 8,
        page_alloc_order: 16,
        page_free_pfn: 8,
        page_shift: 12,
        kmem_cache_size: 24,
        kmem_cache_name: 96,
    };
}

impl Default for KmemLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Conditions the probes count instead of acting on.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Anomaly {
    /// `sys_enter` while the thread already had a syscall pending.
    SyscallReentry = 0,
    UnmatchedSyscallExit = 1,
    UnmatchedAllocExit = 2,
    /// Free of an address the ledger never saw.
    UntrackedFree = 3,
    UnknownStack = 4,
    ReadFailed = 5,
    TableFull = 6,
    RingFull = 7,
}

impl Anomaly {
    pub const COUNT: u32 = 8;

    pub const ALL: [Anomaly; Self::COUNT as usize] = [
        Anomaly::SyscallReentry,
        Anomaly::UnmatchedSyscallExit,
        Anomaly::UnmatchedAllocExit,
        Anomaly::UntrackedFree,
        Anomaly::UnknownStack,
        Anomaly::ReadFailed,
        Anomaly::TableFull,
        Anomaly::RingFull,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Anomaly::SyscallReentry => "syscall_reentry",
            Anomaly::UnmatchedSyscallExit => "unmatched_syscall_exit",
            Anomaly::UnmatchedAllocExit => "unmatched_alloc_exit",
            Anomaly::UntrackedFree => "untracked_free",
            Anomaly::UnknownStack => "unknown_stack",
            Anomaly::ReadFailed => "read_failed",
            Anomaly::TableFull => "table_full",
            Anomaly::RingFull => "ring_full",
        }
    }
}

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for PhaseEvent {}
    unsafe impl aya::Pod for ThreadRecord {}
    unsafe impl aya::Pod for SyscallRecord {}
    unsafe impl aya::Pod for AllocInfo {}
    unsafe impl aya::Pod for AllocStats {}
    unsafe impl aya::Pod for CacheName {}
    unsafe impl aya::Pod for KmemLayout {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_name_stops_at_nul() {
        let name = CacheName::from_bytes(b"kmalloc-64\0garbage");
        assert_eq!(name.as_bytes(), b"kmalloc-64");
    }

    #[test]
    fn cache_name_truncates_long_names() {
        let long = [b'x'; 40];
        let name = CacheName::from_bytes(&long);
        assert_eq!(name.as_bytes().len(), CACHE_NAME_LEN);
    }

    #[test]
    fn phase_round_trips_through_raw_byte() {
        let start = PhaseEvent::new(10, 7, Phase::Start);
        let end = ThreadRecord::new(11, 7, Phase::End, UNKNOWN_STACK);
        assert_eq!(start.phase(), Phase::Start);
        assert_eq!(end.phase(), Phase::End);
        assert_eq!(end.stack(), None);
    }

    #[test]
    fn records_have_no_padding_surprises() {
        assert_eq!(core::mem::size_of::<PhaseEvent>(), 16);
        assert_eq!(core::mem::size_of::<ThreadRecord>(), 24);
        assert_eq!(core::mem::size_of::<SyscallRecord>(), 40);
        assert_eq!(core::mem::size_of::<AllocInfo>(), 24);
        assert_eq!(core::mem::size_of::<AllocStats>(), 32);
        assert_eq!(core::mem::size_of::<KmemLayout>(), 48);
    }

    #[test]
    fn side_ptrs_point_at_matching_fields() {
        let mut stats = AllocStats::default();
        unsafe {
            let (bytes, count) = AllocStats::side_ptrs(&mut stats, Side::Free);
            *bytes += 64;
            *count += 1;
        }
        assert_eq!(
            stats,
            AllocStats {
                alloc_bytes: 0,
                free_bytes: 64,
                alloc_count: 0,
                free_count: 1,
            }
        );
    }

    #[test]
    fn anomaly_indices_are_dense() {
        for (i, a) in Anomaly::ALL.iter().enumerate() {
            assert_eq!(*a as usize, i);
        }
    }
}
