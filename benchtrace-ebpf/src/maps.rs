use aya_ebpf::{
    bindings::BPF_NOEXIST,
    macros::map,
    maps::{HashMap, PerCpuArray, Queue, StackTrace},
};
use benchtrace_common::{
    AllocInfo, AllocStats, Anomaly, CacheName, PhaseEvent, Side, StackId, SyscallRecord,
    ThreadRecord, capacity,
    probe::{Counters, Full, Ring, Table},
};

#[map]
pub static STACKS: StackTrace = StackTrace::with_max_entries(capacity::STACKS, 0);

#[map]
pub static PHASES: Queue<PhaseEvent> = Queue::with_max_entries(capacity::PHASES, 0);

#[map]
pub static THREADS: Queue<ThreadRecord> = Queue::with_max_entries(capacity::THREADS, 0);

#[map]
pub static SYSCALL_START: HashMap<u64, u64> =
    HashMap::with_max_entries(capacity::PENDING_SYSCALLS, 0);

#[map]
pub static SYSCALLS: Queue<SyscallRecord> = Queue::with_max_entries(capacity::SYSCALLS, 0);

#[map]
pub static SIZES: HashMap<u64, u64> = HashMap::with_max_entries(capacity::PENDING_SIZES, 0);

#[map]
pub static MEMPTRS: HashMap<u64, u64> = HashMap::with_max_entries(capacity::PENDING_MEMPTRS, 0);

#[map]
pub static ALLOCS: HashMap<u64, AllocInfo> = HashMap::with_max_entries(capacity::ALLOCS, 0);

#[map]
pub static COMBINED_ALLOCS: HashMap<StackId, AllocStats> =
    HashMap::with_max_entries(capacity::COMBINED_ALLOCS, 0);

#[map]
pub static KERNEL_CACHES: HashMap<CacheName, AllocStats> =
    HashMap::with_max_entries(capacity::KERNEL_CACHES, 0);

#[map]
pub static ANOMALIES: PerCpuArray<u64> = PerCpuArray::with_max_entries(Anomaly::COUNT, 0);

/// Adapter that lets the shared probe code drive a BPF map.
pub struct Bpf<M: 'static>(pub &'static M);

impl<K, V: Copy> Table<K, V> for Bpf<HashMap<K, V>> {
    #[inline(always)]
    fn get(&self, key: &K) -> Option<V> {
        unsafe { self.0.get(key) }.copied()
    }

    #[inline(always)]
    fn insert(&self, key: &K, value: &V) -> Result<(), Full> {
        self.0.insert(key, value, 0).map_err(|_| Full)
    }

    #[inline(always)]
    fn remove(&self, key: &K) -> bool {
        self.0.remove(key).is_ok()
    }
}

impl<T> Ring<T> for Bpf<Queue<T>> {
    #[inline(always)]
    fn push(&self, item: &T) -> Result<(), Full> {
        self.0.push(item, 0).map_err(|_| Full)
    }
}

impl<K> Counters<K> for Bpf<HashMap<K, AllocStats>> {
    #[inline(always)]
    fn add(&self, key: &K, side: Side, bytes: u64) -> Result<(), Full> {
        let stats = match self.0.get_ptr_mut(key) {
            Some(stats) => stats,
            None => {
                // Losing the NOEXIST race is fine: the winner's bucket is used.
                let _ = self.0.insert(key, &AllocStats::default(), BPF_NOEXIST as u64);
                self.0.get_ptr_mut(key).ok_or(Full)?
            }
        };
        unsafe {
            let (total, count) = AllocStats::side_ptrs(stats, side);
            atomic_add(total, bytes);
            atomic_add(count, 1);
        }
        Ok(())
    }
}

/// `lock *(u64 *)(dst + 0) += val`, the BPF fetch-and-add.
#[inline(always)]
unsafe fn atomic_add(dst: *mut u64, val: u64) {
    unsafe {
        core::arch::asm!(
            "lock *(u64 *)({dst} + 0) += {val}",
            dst = in(reg) dst,
            val = in(reg) val,
            options(nostack),
        );
    }
}
