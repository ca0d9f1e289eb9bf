use aya_ebpf::{
    EbpfContext,
    bindings::BPF_F_USER_STACK,
    helpers::{
        bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_kernel_str_bytes, bpf_probe_read_user,
    },
};
use benchtrace_common::{
    Anomaly, CacheName, KmemLayout, StackId, UNKNOWN_STACK,
    probe::{Kernel, cache::CacheObject},
};
use bytemuck::Zeroable;

use crate::maps::{ANOMALIES, STACKS};

// Attach-time configuration, rewritten by the loader.
#[unsafe(no_mangle)]
static TARGET_PID: u32 = 0;

#[unsafe(no_mangle)]
static MIN_CACHE_OBJECT_SIZE: u64 = 0;

#[unsafe(no_mangle)]
static DIAGNOSTICS_ENABLED: u8 = 0;

#[unsafe(no_mangle)]
static KMEM_LAYOUT: KmemLayout = KmemLayout::DEFAULT;

#[inline(always)]
pub fn min_cache_object_size() -> u64 {
    unsafe { core::ptr::read_volatile(&MIN_CACHE_OBJECT_SIZE) }
}

#[inline(always)]
pub fn kmem_layout() -> KmemLayout {
    unsafe { core::ptr::read_volatile(&KMEM_LAYOUT) }
}

/// The running program seen through [`Kernel`].
pub struct Probe<'a, C> {
    ctx: &'a C,
}

impl<'a, C: EbpfContext> Probe<'a, C> {
    #[inline(always)]
    pub fn new(ctx: &'a C) -> Self {
        Self { ctx }
    }
}

impl<C: EbpfContext> Kernel for Probe<'_, C> {
    #[inline(always)]
    fn target_pid(&self) -> u32 {
        unsafe { core::ptr::read_volatile(&TARGET_PID) }
    }

    #[inline(always)]
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn ktime_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn user_stack_id(&self) -> StackId {
        unsafe { STACKS.get_stackid(self.ctx, BPF_F_USER_STACK as u64) }.unwrap_or(UNKNOWN_STACK)
    }

    #[inline(always)]
    fn read_user_u64(&self, addr: u64) -> Option<u64> {
        unsafe { bpf_probe_read_user(addr as *const u64) }.ok()
    }

    #[inline(always)]
    fn diagnostics(&self) -> bool {
        unsafe { core::ptr::read_volatile(&DIAGNOSTICS_ENABLED) != 0 }
    }

    #[inline(always)]
    fn note(&self, anomaly: Anomaly) {
        // Per-CPU slot: no other writer.
        if let Some(count) = ANOMALIES.get_ptr_mut(anomaly as u32) {
            unsafe { *count += 1 };
        }
    }
}

/// `struct kmem_cache *` read through the configured field offsets.
pub struct KmemCache {
    addr: u64,
    layout: KmemLayout,
}

impl KmemCache {
    #[inline(always)]
    pub fn new(addr: u64, layout: KmemLayout) -> Self {
        Self { addr, layout }
    }
}

impl CacheObject for KmemCache {
    #[inline(always)]
    fn slot_size(&self) -> Option<u64> {
        if self.addr == 0 {
            return None;
        }
        let field = (self.addr + self.layout.kmem_cache_size as u64) as *const u32;
        unsafe { bpf_probe_read_kernel(field) }.ok().map(u64::from)
    }

    #[inline(always)]
    fn name(&self) -> Option<CacheName> {
        if self.addr == 0 {
            return None;
        }
        let field = (self.addr + self.layout.kmem_cache_name as u64) as *const u64;
        let name_ptr = unsafe { bpf_probe_read_kernel(field) }.ok()?;
        if name_ptr == 0 {
            return None;
        }
        let mut name = CacheName::zeroed();
        unsafe { bpf_probe_read_kernel_str_bytes(name_ptr as *const u8, &mut name.name) }.ok()?;
        Some(name)
    }
}
