//! Allocation ledger and per-stack leak totals.
//!
//! Allocators report the requested size on entry and the address on return,
//! so the size waits in `sizes` under the caller's pid/tgid until the
//! matching exit. A second entry before that exit overwrites the pending
//! size; the last request wins.
//!
//! Frees are charged to the stack recorded at allocation time, which is
//! what makes `alloc_bytes - free_bytes` per stack a live-bytes estimate
//! for that call site.

use super::{Counters, Kernel, Table, filter, stack_of};
use crate::{AllocInfo, Anomaly, Side, StackId};

/// `mmap` reports failure as `MAP_FAILED` rather than null.
pub const MAP_FAILED: u64 = u64::MAX;

pub struct Heap<'a, S, A, C> {
    pub sizes: &'a S,
    pub allocs: &'a A,
    pub stats: &'a C,
}

impl<S, A, C> Heap<'_, S, A, C>
where
    S: Table<u64, u64>,
    A: Table<u64, AllocInfo>,
    C: Counters<StackId>,
{
    #[inline(always)]
    pub fn alloc_enter<K: Kernel>(&self, k: &K, size: u64) {
        let Some(pid_tgid) = filter::current(k) else {
            return;
        };
        if self.sizes.insert(&pid_tgid, &size).is_err() {
            k.note(Anomaly::TableFull);
        }
    }

    /// A null `address` consumes the pending size without recording anything.
    #[inline(always)]
    pub fn alloc_exit<K: Kernel>(&self, k: &K, address: u64) {
        let Some(pid_tgid) = filter::current(k) else {
            return;
        };
        let Some(size) = self.sizes.get(&pid_tgid) else {
            if k.diagnostics() {
                k.note(Anomaly::UnmatchedAllocExit);
            }
            return;
        };
        self.sizes.remove(&pid_tgid);
        self.track(k, address, size);
    }

    /// An allocation whose size and address are known at the same point,
    /// as in the kernel allocator tracepoints. Leaves the thread's pending
    /// size alone so a kernel allocation inside a user allocator call does
    /// not clobber it.
    #[inline(always)]
    pub fn record<K: Kernel>(&self, k: &K, address: u64, size: u64) {
        if filter::current(k).is_none() {
            return;
        }
        self.track(k, address, size);
    }

    #[inline(always)]
    fn track<K: Kernel>(&self, k: &K, address: u64, size: u64) {
        if address == 0 {
            return;
        }

        let info = AllocInfo {
            size,
            timestamp_ns: k.ktime_ns(),
            stack_id: stack_of(k),
        };
        // Only charge the stack when the free can find this entry later.
        if self.allocs.insert(&address, &info).is_err() {
            k.note(Anomaly::TableFull);
            return;
        }
        if self.stats.add(&info.stack_id, Side::Alloc, size).is_err() {
            k.note(Anomaly::TableFull);
        }
    }

    #[inline(always)]
    pub fn free_enter<K: Kernel>(&self, k: &K, address: u64) {
        if filter::current(k).is_none() {
            return;
        }
        let Some(info) = self.allocs.get(&address) else {
            if k.diagnostics() {
                k.note(Anomaly::UntrackedFree);
            }
            return;
        };
        // Two racing frees of one address: only the successful delete counts.
        if !self.allocs.remove(&address) {
            return;
        }
        if self.stats.add(&info.stack_id, Side::Free, info.size).is_err() {
            k.note(Anomaly::TableFull);
        }
    }

    /// Resize expressed as a free of the old block and a new request.
    /// `realloc(NULL, n)` is a plain allocation.
    #[inline(always)]
    pub fn realloc_enter<K: Kernel>(&self, k: &K, old: u64, size: u64) {
        if old != 0 {
            self.free_enter(k, old);
        }
        self.alloc_enter(k, size);
    }

    /// `mmap`-style return where failure is `MAP_FAILED`.
    #[inline(always)]
    pub fn mmap_exit<K: Kernel>(&self, k: &K, address: u64) {
        let address = if address == MAP_FAILED { 0 } else { address };
        self.alloc_exit(k, address);
    }

    /// Entry of an allocator that returns the block through `*memptr`.
    #[inline(always)]
    pub fn memptr_enter<K: Kernel, M: Table<u64, u64>>(
        &self,
        k: &K,
        memptrs: &M,
        memptr: u64,
        size: u64,
    ) {
        let Some(pid_tgid) = filter::current(k) else {
            return;
        };
        if memptrs.insert(&pid_tgid, &memptr).is_err() {
            k.note(Anomaly::TableFull);
            return;
        }
        self.alloc_enter(k, size);
    }

    /// Reads the block address back out of `*memptr`. A non-zero `ret` or a
    /// failed read counts as a failed allocation.
    #[inline(always)]
    pub fn memptr_exit<K: Kernel, M: Table<u64, u64>>(&self, k: &K, memptrs: &M, ret: i64) {
        let Some(pid_tgid) = filter::current(k) else {
            return;
        };
        let Some(memptr) = memptrs.get(&pid_tgid) else {
            return;
        };
        memptrs.remove(&pid_tgid);

        let address = if ret != 0 {
            0
        } else {
            match k.read_user_u64(memptr) {
                Some(address) => address,
                None => {
                    k.note(Anomaly::ReadFailed);
                    0
                }
            }
        };
        self.alloc_exit(k, address);
    }
}
