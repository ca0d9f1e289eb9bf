use super::{Kernel, Ring, Table, filter, stack_of};
use crate::{Anomaly, SyscallRecord};

/// Per-thread syscall timing: `sys_enter` parks the entry timestamp under
/// the caller's pid/tgid, `sys_exit` consumes it and appends the completed
/// record to the ledger.
pub struct Syscalls<'a, P, L> {
    pub pending: &'a P,
    pub ledger: &'a L,
}

impl<P, L> Syscalls<'_, P, L>
where
    P: Table<u64, u64>,
    L: Ring<SyscallRecord>,
{
    #[inline(always)]
    pub fn enter<K: Kernel>(&self, k: &K) {
        let Some(pid_tgid) = filter::current(k) else {
            return;
        };
        // A pending entry here means an exit went missing. Overwrite it.
        if k.diagnostics() && self.pending.get(&pid_tgid).is_some() {
            k.note(Anomaly::SyscallReentry);
        }
        if self.pending.insert(&pid_tgid, &k.ktime_ns()).is_err() {
            k.note(Anomaly::TableFull);
        }
    }

    #[inline(always)]
    pub fn exit<K: Kernel>(&self, k: &K, syscall_id: i64) {
        let Some(pid_tgid) = filter::current(k) else {
            return;
        };
        let end_ns = k.ktime_ns();
        let Some(start_ns) = self.pending.get(&pid_tgid) else {
            if k.diagnostics() {
                k.note(Anomaly::UnmatchedSyscallExit);
            }
            return;
        };
        self.pending.remove(&pid_tgid);

        let record = SyscallRecord {
            syscall_id,
            stack_id: stack_of(k),
            pid_tgid,
            start_ns,
            end_ns,
        };
        if self.ledger.push(&record).is_err() {
            k.note(Anomaly::RingFull);
        }
    }
}
