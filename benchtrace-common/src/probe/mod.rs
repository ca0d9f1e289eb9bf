//! Probe bodies shared by the eBPF object and the host tests.
//!
//! Everything here runs in probe context. Failures drop the event and at most
//! bump an [`Anomaly`] counter. The kernel side and the tables are reached
//! through the traits below, implemented over BPF maps in the eBPF crate and
//! by `sim` in tests.

pub mod cache;
pub mod filter;
pub mod memory;
pub mod phase;
pub mod syscalls;
pub mod threads;

#[cfg(test)]
pub(crate) mod sim;

use crate::{Anomaly, Side, StackId, UNKNOWN_STACK};

/// An insert was rejected, normally because the table is at capacity.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Full;

/// What a probe can ask of the kernel for the current invocation.
pub trait Kernel {
    /// Process whose events are recorded.
    fn target_pid(&self) -> u32;

    /// `tgid << 32 | tid` of the calling thread.
    fn pid_tgid(&self) -> u64;

    /// Monotonic clock in nanoseconds.
    fn ktime_ns(&self) -> u64;

    /// Interns the calling thread's user stack, `UNKNOWN_STACK` on failure.
    fn user_stack_id(&self) -> StackId;

    /// Safe read of a `u64` from user memory.
    fn read_user_u64(&self, addr: u64) -> Option<u64>;

    /// Whether pairing anomalies should be counted.
    fn diagnostics(&self) -> bool;

    fn note(&self, anomaly: Anomaly);
}

/// Fixed-capacity keyed table.
pub trait Table<K, V: Copy> {
    fn get(&self, key: &K) -> Option<V>;

    /// Inserts or overwrites.
    fn insert(&self, key: &K, value: &V) -> Result<(), Full>;

    /// `true` only for the caller whose delete actually removed the entry.
    fn remove(&self, key: &K) -> bool;
}

/// Fixed-capacity FIFO that rejects pushes once full.
pub trait Ring<T> {
    fn push(&self, item: &T) -> Result<(), Full>;
}

/// Table of [`crate::AllocStats`] buckets updated with fetch-and-add.
pub trait Counters<K> {
    /// Adds `bytes` and one event to `side` of the bucket for `key`,
    /// creating a zeroed bucket first if there is none.
    fn add(&self, key: &K, side: Side, bytes: u64) -> Result<(), Full>;
}

#[inline(always)]
pub(crate) fn stack_of<K: Kernel>(k: &K) -> StackId {
    let stack_id = k.user_stack_id();
    if stack_id == UNKNOWN_STACK {
        k.note(Anomaly::UnknownStack);
    }
    stack_id
}
