use anyhow::{Context as _, Result, anyhow};
use aya::{
    Ebpf, Pod,
    maps::{HashMap, Map, MapData, MapError, PerCpuArray, Queue, StackTraceMap},
};
use benchtrace_common::{
    AllocInfo, AllocStats, Anomaly, CacheName, PhaseEvent, StackId, SyscallRecord, ThreadRecord,
    names,
};
use log::debug;

use crate::config::Capacities;
use crate::report::{Collected, Snapshot};

fn take<T>(ebpf: &mut Ebpf, name: &str) -> Result<T>
where
    T: TryFrom<Map, Error = MapError>,
{
    let map = ebpf.take_map(name).ok_or_else(|| anyhow!("map {name} not found"))?;
    T::try_from(map).with_context(|| format!("opening map {name}"))
}

/// Pops at most `limit` items so a producer outrunning us cannot stall a drain.
fn pop_all<V: Pod>(queue: &mut Queue<MapData, V>, limit: u32) -> impl Iterator<Item = V> + '_ {
    std::iter::from_fn(move || queue.pop(0).ok()).take(limit as usize)
}

/// User-side handles on the object's maps.
pub struct Tables {
    phases: Queue<MapData, PhaseEvent>,
    threads: Queue<MapData, ThreadRecord>,
    syscalls: Queue<MapData, SyscallRecord>,
    allocs: HashMap<MapData, u64, AllocInfo>,
    stack_stats: HashMap<MapData, StackId, AllocStats>,
    caches: HashMap<MapData, CacheName, AllocStats>,
    anomalies: PerCpuArray<MapData, u64>,
    pub stacks: StackTraceMap<MapData>,
    limits: Capacities,
}

impl Tables {
    pub fn take(ebpf: &mut Ebpf, limits: &Capacities) -> Result<Self> {
        Ok(Self {
            phases: take(ebpf, names::PHASES)?,
            threads: take(ebpf, names::THREADS)?,
            syscalls: take(ebpf, names::SYSCALLS)?,
            allocs: take(ebpf, names::ALLOCS)?,
            stack_stats: take(ebpf, names::COMBINED_ALLOCS)?,
            caches: take(ebpf, names::KERNEL_CACHES)?,
            anomalies: take(ebpf, names::ANOMALIES)?,
            stacks: take(ebpf, names::STACKS)?,
            limits: limits.clone(),
        })
    }

    /// Empties the rings into `collected`.
    pub fn drain(&mut self, collected: &mut Collected) {
        let before = (collected.phases.len(), collected.threads.len());
        collected.phases.extend(pop_all(&mut self.phases, self.limits.phase_ring));
        collected.threads.extend(pop_all(&mut self.threads, self.limits.thread_ring));

        let mut syscalls = 0;
        for record in pop_all(&mut self.syscalls, self.limits.syscall_ring) {
            collected.syscalls.add(&record);
            syscalls += 1;
        }
        debug!(
            "drained {} phase, {} thread and {} syscall records",
            collected.phases.len() - before.0,
            collected.threads.len() - before.1,
            syscalls
        );
    }

    /// Reads the cumulative tables without clearing them.
    pub fn snapshot(&self) -> Snapshot {
        let mut anomalies = [0u64; Anomaly::COUNT as usize];
        for anomaly in Anomaly::ALL {
            if let Ok(per_cpu) = self.anomalies.get(&(anomaly as u32), 0) {
                anomalies[anomaly as usize] = per_cpu.iter().sum();
            }
        }
        Snapshot {
            live: self.allocs.iter().filter_map(Result::ok).collect(),
            stacks: self.stack_stats.iter().filter_map(Result::ok).collect(),
            caches: self.caches.iter().filter_map(Result::ok).collect(),
            anomalies,
        }
    }
}
