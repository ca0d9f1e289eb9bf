#![no_std]
#![no_main]
#![feature(asm_experimental_arch)]

mod kernel;
mod maps;

use aya_ebpf::{
    macros::{kprobe, tracepoint, uprobe, uretprobe},
    maps::{HashMap, Queue},
    programs::{ProbeContext, RetProbeContext, TracePointContext},
};
use benchtrace_common::{
    AllocInfo, AllocStats, CacheName, PhaseEvent, StackId, SyscallRecord, ThreadRecord,
    probe::{cache::CacheCounter, memory::Heap, phase, syscalls::Syscalls, threads},
};

use crate::kernel::{KmemCache, Probe, kmem_layout, min_cache_object_size};
use crate::maps::{
    ALLOCS, Bpf, COMBINED_ALLOCS, KERNEL_CACHES, MEMPTRS, PHASES, SIZES, SYSCALL_START,
    SYSCALLS, THREADS,
};

// Common to raw_syscalls:sys_{enter,exit} and syscalls:sys_exit_*.
const SYSCALL_ID_OFFSET: usize = 8;
const SYSCALL_RET_OFFSET: usize = 16;

static PHASE_RING: Bpf<Queue<PhaseEvent>> = Bpf(&PHASES);
static THREAD_RING: Bpf<Queue<ThreadRecord>> = Bpf(&THREADS);
static PENDING_SYSCALLS: Bpf<HashMap<u64, u64>> = Bpf(&SYSCALL_START);
static SYSCALL_LEDGER: Bpf<Queue<SyscallRecord>> = Bpf(&SYSCALLS);
static PENDING_SIZES: Bpf<HashMap<u64, u64>> = Bpf(&SIZES);
static PENDING_MEMPTRS: Bpf<HashMap<u64, u64>> = Bpf(&MEMPTRS);
static LEDGER: Bpf<HashMap<u64, AllocInfo>> = Bpf(&ALLOCS);
static STACK_STATS: Bpf<HashMap<StackId, AllocStats>> = Bpf(&COMBINED_ALLOCS);
static CACHE_STATS: Bpf<HashMap<CacheName, AllocStats>> = Bpf(&KERNEL_CACHES);

type Ledger = Heap<
    'static,
    Bpf<HashMap<u64, u64>>,
    Bpf<HashMap<u64, AllocInfo>>,
    Bpf<HashMap<StackId, AllocStats>>,
>;

#[inline(always)]
fn heap() -> Ledger {
    Heap {
        sizes: &PENDING_SIZES,
        allocs: &LEDGER,
        stats: &STACK_STATS,
    }
}

#[inline(always)]
fn syscalls() -> Syscalls<'static, Bpf<HashMap<u64, u64>>, Bpf<Queue<SyscallRecord>>> {
    Syscalls {
        pending: &PENDING_SYSCALLS,
        ledger: &SYSCALL_LEDGER,
    }
}

#[inline(always)]
fn arg(ctx: &ProbeContext, n: usize) -> u64 {
    ctx.arg::<u64>(n).unwrap_or(0)
}

#[inline(always)]
fn ret(ctx: &RetProbeContext) -> u64 {
    ctx.ret::<u64>().unwrap_or(0)
}

/* benchmark phase markers */

#[uprobe]
pub fn phase_start(ctx: ProbeContext) -> u32 {
    phase::mark_start(&Probe::new(&ctx), &PHASE_RING);
    0
}

#[uprobe]
pub fn phase_end(ctx: ProbeContext) -> u32 {
    phase::mark_end(&Probe::new(&ctx), &PHASE_RING);
    0
}

/* threads */

#[tracepoint]
pub fn clone_exit(ctx: TracePointContext) -> u32 {
    let ret = unsafe { ctx.read_at::<i64>(SYSCALL_RET_OFFSET) }.unwrap_or(-1);
    threads::spawned(&Probe::new(&ctx), &THREAD_RING, ret);
    0
}

#[tracepoint]
pub fn process_exit(ctx: TracePointContext) -> u32 {
    threads::exited(
        &Probe::new(&ctx),
        &THREAD_RING,
        [&PENDING_SYSCALLS, &PENDING_SIZES, &PENDING_MEMPTRS],
    );
    0
}

/* syscalls */

#[tracepoint]
pub fn sys_enter(ctx: TracePointContext) -> u32 {
    syscalls().enter(&Probe::new(&ctx));
    0
}

#[tracepoint]
pub fn sys_exit(ctx: TracePointContext) -> u32 {
    let id = unsafe { ctx.read_at::<i64>(SYSCALL_ID_OFFSET) }.unwrap_or(-1);
    syscalls().exit(&Probe::new(&ctx), id);
    0
}

/* user-space allocators */

/// malloc, valloc, pvalloc: size is the first argument.
#[uprobe]
pub fn alloc_enter(ctx: ProbeContext) -> u32 {
    heap().alloc_enter(&Probe::new(&ctx), arg(&ctx, 0));
    0
}

/// mmap, aligned_alloc, memalign: size is the second argument.
#[uprobe]
pub fn alloc_enter_arg1(ctx: ProbeContext) -> u32 {
    heap().alloc_enter(&Probe::new(&ctx), arg(&ctx, 1));
    0
}

#[uprobe]
pub fn calloc_enter(ctx: ProbeContext) -> u32 {
    let size = arg(&ctx, 0).saturating_mul(arg(&ctx, 1));
    heap().alloc_enter(&Probe::new(&ctx), size);
    0
}

#[uprobe]
pub fn realloc_enter(ctx: ProbeContext) -> u32 {
    heap().realloc_enter(&Probe::new(&ctx), arg(&ctx, 0), arg(&ctx, 1));
    0
}

#[uretprobe]
pub fn alloc_exit(ctx: RetProbeContext) -> u32 {
    heap().alloc_exit(&Probe::new(&ctx), ret(&ctx));
    0
}

#[uretprobe]
pub fn mmap_exit(ctx: RetProbeContext) -> u32 {
    heap().mmap_exit(&Probe::new(&ctx), ret(&ctx));
    0
}

/// free and munmap.
#[uprobe]
pub fn free_enter(ctx: ProbeContext) -> u32 {
    heap().free_enter(&Probe::new(&ctx), arg(&ctx, 0));
    0
}

#[uprobe]
pub fn posix_memalign_enter(ctx: ProbeContext) -> u32 {
    heap().memptr_enter(&Probe::new(&ctx), &PENDING_MEMPTRS, arg(&ctx, 0), arg(&ctx, 2));
    0
}

#[uretprobe]
pub fn posix_memalign_exit(ctx: RetProbeContext) -> u32 {
    let ret = ctx.ret::<i32>().unwrap_or(-1) as i64;
    heap().memptr_exit(&Probe::new(&ctx), &PENDING_MEMPTRS, ret);
    0
}

/* kernel allocators, attributed to the user stack that caused them */

#[inline(always)]
fn kernel_alloc(ctx: &TracePointContext, address_offset: u32, size_offset: u32) -> u32 {
    let address = unsafe { ctx.read_at::<u64>(address_offset as usize) }.unwrap_or(0);
    let size = unsafe { ctx.read_at::<u64>(size_offset as usize) }.unwrap_or(0);
    heap().record(&Probe::new(ctx), address, size);
    0
}

#[inline(always)]
fn kernel_free(ctx: &TracePointContext, address_offset: u32) -> u32 {
    let address = unsafe { ctx.read_at::<u64>(address_offset as usize) }.unwrap_or(0);
    heap().free_enter(&Probe::new(ctx), address);
    0
}

#[tracepoint]
pub fn kmalloc(ctx: TracePointContext) -> u32 {
    let layout = kmem_layout();
    kernel_alloc(&ctx, layout.kmalloc_ptr, layout.kmalloc_bytes_alloc)
}

#[tracepoint]
pub fn kfree(ctx: TracePointContext) -> u32 {
    kernel_free(&ctx, kmem_layout().kfree_ptr)
}

#[tracepoint]
pub fn kmem_cache_alloc(ctx: TracePointContext) -> u32 {
    let layout = kmem_layout();
    kernel_alloc(&ctx, layout.cache_alloc_ptr, layout.cache_alloc_bytes_alloc)
}

#[tracepoint]
pub fn kmem_cache_free(ctx: TracePointContext) -> u32 {
    kernel_free(&ctx, kmem_layout().cache_free_ptr)
}

#[tracepoint]
pub fn mm_page_alloc(ctx: TracePointContext) -> u32 {
    let layout = kmem_layout();
    let pfn = unsafe { ctx.read_at::<u64>(layout.page_alloc_pfn as usize) }.unwrap_or(0);
    let order = unsafe { ctx.read_at::<u32>(layout.page_alloc_order as usize) }.unwrap_or(0);
    let size = 1u64 << ((layout.page_shift + order) & 63);
    heap().record(&Probe::new(&ctx), pfn, size);
    0
}

#[tracepoint]
pub fn mm_page_free(ctx: TracePointContext) -> u32 {
    kernel_free(&ctx, kmem_layout().page_free_pfn)
}

/* per-cache counters */

#[inline(always)]
fn cache_counter() -> CacheCounter<'static, Bpf<HashMap<CacheName, AllocStats>>> {
    CacheCounter {
        stats: &CACHE_STATS,
        min_slot_size: min_cache_object_size(),
    }
}

#[kprobe]
pub fn cache_alloc(ctx: ProbeContext) -> u32 {
    let cache = KmemCache::new(arg(&ctx, 0), kmem_layout());
    cache_counter().alloc(&Probe::new(&ctx), &cache);
    0
}

#[kprobe]
pub fn cache_free(ctx: ProbeContext) -> u32 {
    let cache = KmemCache::new(arg(&ctx, 0), kmem_layout());
    cache_counter().free(&Probe::new(&ctx), &cache);
    0
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
