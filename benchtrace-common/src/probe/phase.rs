use super::{Kernel, Ring, filter};
use crate::{Anomaly, Phase, PhaseEvent};

/// Records a phase boundary for the calling thread. Lost when the ring is full.
#[inline(always)]
pub fn mark<K: Kernel, R: Ring<PhaseEvent>>(k: &K, ring: &R, phase: Phase) {
    let Some(pid_tgid) = filter::current(k) else {
        return;
    };
    let event = PhaseEvent::new(k.ktime_ns(), filter::tid_of(pid_tgid), phase);
    if ring.push(&event).is_err() {
        k.note(Anomaly::RingFull);
    }
}

#[inline(always)]
pub fn mark_start<K: Kernel, R: Ring<PhaseEvent>>(k: &K, ring: &R) {
    mark(k, ring, Phase::Start)
}

#[inline(always)]
pub fn mark_end<K: Kernel, R: Ring<PhaseEvent>>(k: &K, ring: &R) {
    mark(k, ring, Phase::End)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::sim::{Host, SimRing};

    #[test]
    fn brackets_a_phase() {
        let host = Host::new(100);
        let ring = SimRing::new(4);
        host.set_clock(1_000);
        mark_start(&host.thread(100, 101), &ring);
        host.set_clock(5_000);
        mark_end(&host.thread(100, 101), &ring);

        let events = ring.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase(), Phase::Start);
        assert_eq!(events[0].timestamp_ns, 1_000);
        assert_eq!(events[0].thread_id, 101);
        assert_eq!(events[1].phase(), Phase::End);
        assert_eq!(events[1].timestamp_ns, 5_000);
    }

    #[test]
    fn full_ring_drops_new_marks() {
        let host = Host::new(1);
        let ring = SimRing::new(2);
        let k = host.thread(1, 1);
        for _ in 0..5 {
            mark_start(&k, &ring);
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(host.anomaly(Anomaly::RingFull), 3);
    }

    #[test]
    fn other_processes_are_ignored() {
        let host = Host::new(1);
        let ring = SimRing::new(2);
        mark_start(&host.thread(2, 2), &ring);
        assert_eq!(ring.len(), 0);
    }
}
