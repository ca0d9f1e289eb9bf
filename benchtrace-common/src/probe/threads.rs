use super::{Kernel, Ring, Table, filter, stack_of};
use crate::{Anomaly, Phase, ThreadRecord, UNKNOWN_STACK};

/// Return of a clone-family syscall in the traced process.
///
/// Only the parent sees the child's id; the child's own `0` return and
/// failures are skipped.
#[inline(always)]
pub fn spawned<K: Kernel, R: Ring<ThreadRecord>>(k: &K, ring: &R, ret: i64) {
    if filter::current(k).is_none() || ret <= 0 {
        return;
    }
    let record = ThreadRecord::new(k.ktime_ns(), ret as u32, Phase::Start, stack_of(k));
    if ring.push(&record).is_err() {
        k.note(Anomaly::RingFull);
    }
}

/// Exit notification for the calling thread.
///
/// A thread that dies inside `exit` never returns from it, so whatever it
/// left in the per-thread `pending` tables is released here.
#[inline(always)]
pub fn exited<K, R, T, const N: usize>(k: &K, ring: &R, pending: [&T; N])
where
    K: Kernel,
    R: Ring<ThreadRecord>,
    T: Table<u64, u64>,
{
    let Some(pid_tgid) = filter::current(k) else {
        return;
    };
    for table in pending {
        table.remove(&pid_tgid);
    }
    let record = ThreadRecord::new(
        k.ktime_ns(),
        filter::tid_of(pid_tgid),
        Phase::End,
        UNKNOWN_STACK,
    );
    if ring.push(&record).is_err() {
        k.note(Anomaly::RingFull);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::sim::{Host, SimRing, SimTable};
    use crate::probe::syscalls::Syscalls;

    const NO_PENDING: [&SimTable<u64, u64>; 0] = [];

    #[test]
    fn records_child_id_at_parent_return() {
        let host = Host::new(10);
        let ring = SimRing::new(8);
        host.set_clock(50);
        let parent = host.thread(10, 10).with_stack(&[0x400100, 0x400200]);
        spawned(&parent, &ring, 11);
        host.set_clock(90);
        exited(&host.thread(10, 11), &ring, NO_PENDING);

        let records = ring.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].thread_id, 11);
        assert_eq!(records[0].phase(), Phase::Start);
        assert!(records[0].stack().is_some());
        assert_eq!(records[1].thread_id, 11);
        assert_eq!(records[1].phase(), Phase::End);
        assert_eq!(records[1].timestamp_ns, 90);
    }

    #[test]
    fn child_side_and_failures_are_skipped() {
        let host = Host::new(10);
        let ring = SimRing::new(8);
        let k = host.thread(10, 12);
        spawned(&k, &ring, 0);
        spawned(&k, &ring, -11);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn foreign_exits_are_filtered() {
        let host = Host::new(10);
        let ring = SimRing::new(8);
        exited(&host.thread(11, 11), &ring, NO_PENDING);
        spawned(&host.thread(11, 11), &ring, 20);
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn exit_releases_pending_entries_of_the_dead_thread() {
        let host = Host::new(10);
        let ring = SimRing::new(8);
        let pending = SimTable::new(2);
        let sizes = SimTable::new(2);
        let ledger = SimRing::new(8);
        let sys = Syscalls {
            pending: &pending,
            ledger: &ledger,
        };

        // Both threads die inside exit, so no sys_exit ever pairs them.
        for tid in [11, 12] {
            let k = host.thread(10, tid);
            sys.enter(&k);
            sizes.insert(&k.pid_tgid(), &64).unwrap();
            exited(&k, &ring, [&pending, &sizes]);
        }
        assert_eq!(pending.len(), 0);
        assert_eq!(sizes.len(), 0);

        let live = host.thread(10, 13);
        sys.enter(&live);
        sys.exit(&live, 0);
        assert_eq!(ledger.len(), 1);
        assert_eq!(host.anomaly(Anomaly::TableFull), 0);
    }

    #[test]
    fn foreign_exit_leaves_pending_entries_alone() {
        let host = Host::new(10);
        let ring = SimRing::new(8);
        let pending = SimTable::new(4);
        let foreign = host.thread(11, 11);
        pending.insert(&foreign.pid_tgid(), &5).unwrap();
        exited(&foreign, &ring, [&pending]);
        assert_eq!(pending.len(), 1);
    }
}
