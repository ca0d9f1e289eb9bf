use std::collections::{BTreeMap, HashMap};

use benchtrace_common::{
    AllocInfo, AllocStats, Anomaly, CacheName, Phase, PhaseEvent, StackId, SyscallRecord,
    ThreadRecord,
};
use log::info;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Latency {
    count: u64,
    total_ns: u64,
    max_ns: u64,
}

impl Latency {
    fn add(&mut self, ns: u64) {
        self.count += 1;
        self.total_ns = self.total_ns.saturating_add(ns);
        self.max_ns = self.max_ns.max(ns);
    }

    fn mean_ns(&self) -> u64 {
        self.total_ns / self.count.max(1)
    }
}

/// Latency of one syscall number issued from one call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallSite {
    pub stack_id: StackId,
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
    pub frames: Vec<String>,
}

/// Latency totals of one syscall number, with its costliest call sites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallSummary {
    pub id: i64,
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
    pub mean_ns: u64,
    pub sites: Vec<SyscallSite>,
}

/// Running aggregation of the syscall ledger. Records are folded in as they
/// are drained so the ledger itself never has to be kept.
#[derive(Debug, Default)]
pub struct SyscallTotals {
    by_id: BTreeMap<i64, Latency>,
    by_site: HashMap<(i64, StackId), Latency>,
}

impl SyscallTotals {
    pub fn add(&mut self, record: &SyscallRecord) {
        let latency = record.latency_ns();
        self.by_id.entry(record.syscall_id).or_default().add(latency);
        self.by_site
            .entry((record.syscall_id, record.stack_id))
            .or_default()
            .add(latency);
    }

    pub fn count(&self) -> u64 {
        self.by_id.values().map(|l| l.count).sum()
    }

    /// Slowest syscalls first by total time, each with its `top` slowest
    /// call stacks.
    pub fn summaries(
        &self,
        top: usize,
        mut frames: impl FnMut(StackId) -> Vec<String>,
    ) -> Vec<SyscallSummary> {
        let mut sites: HashMap<i64, Vec<(StackId, Latency)>> = HashMap::new();
        for (&(id, stack_id), &latency) in &self.by_site {
            sites.entry(id).or_default().push((stack_id, latency));
        }

        let mut out: Vec<_> = self
            .by_id
            .iter()
            .map(|(&id, latency)| {
                let mut own = sites.remove(&id).unwrap_or_default();
                own.sort_by(|(a_id, a), (b_id, b)| {
                    b.total_ns.cmp(&a.total_ns).then(a_id.cmp(b_id))
                });
                SyscallSummary {
                    id,
                    count: latency.count,
                    total_ns: latency.total_ns,
                    max_ns: latency.max_ns,
                    mean_ns: latency.mean_ns(),
                    sites: own
                        .into_iter()
                        .take(top)
                        .map(|(stack_id, l)| SyscallSite {
                            stack_id,
                            count: l.count,
                            total_ns: l.total_ns,
                            max_ns: l.max_ns,
                            frames: frames(stack_id),
                        })
                        .collect(),
                }
            })
            .collect();
        out.sort_by(|a, b| b.total_ns.cmp(&a.total_ns).then(a.id.cmp(&b.id)));
        out
    }
}

/// Everything popped from the rings during a run.
#[derive(Debug, Default)]
pub struct Collected {
    pub phases: Vec<PhaseEvent>,
    pub threads: Vec<ThreadRecord>,
    pub syscalls: SyscallTotals,
}

/// Copy of the non-destructive tables at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub live: Vec<(u64, AllocInfo)>,
    pub stacks: Vec<(StackId, AllocStats)>,
    pub caches: Vec<(CacheName, AllocStats)>,
    pub anomalies: [u64; Anomaly::COUNT as usize],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseSpan {
    pub thread_id: u32,
    pub start_ns: u64,
    pub end_ns: u64,
    pub duration_ns: u64,
}

/// A thread's observed life. Threads alive when tracing began have no start,
/// threads still running at the end have no end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadSpan {
    pub thread_id: u32,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
    pub lifetime_ns: Option<u64>,
    pub spawn_stack: Option<StackId>,
    pub spawn_frames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakSite {
    pub stack_id: StackId,
    pub live_bytes: i64,
    pub live_count: i64,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub alloc_count: u64,
    pub free_count: u64,
    pub frames: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    pub name: String,
    pub alloc_bytes: u64,
    pub free_bytes: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub pid: u32,
    pub phases: Vec<PhaseSpan>,
    pub threads: Vec<ThreadSpan>,
    pub syscalls: Vec<SyscallSummary>,
    pub live_allocations: usize,
    pub live_bytes: u64,
    pub leaks: Vec<LeakSite>,
    pub kernel_caches: Vec<CacheSummary>,
    pub anomalies: BTreeMap<&'static str, u64>,
}

/// Pairs start and end markers per thread in timestamp order. A second start
/// before an end restarts the phase; ends with no open start are dropped.
pub fn pair_phases(events: &[PhaseEvent]) -> Vec<PhaseSpan> {
    let mut sorted = events.to_vec();
    sorted.sort_by_key(|e| e.timestamp_ns);

    let mut open: HashMap<u32, u64> = HashMap::new();
    let mut spans = Vec::new();
    for event in sorted {
        match event.phase() {
            Phase::Start => {
                open.insert(event.thread_id, event.timestamp_ns);
            }
            Phase::End => {
                if let Some(start_ns) = open.remove(&event.thread_id) {
                    spans.push(PhaseSpan {
                        thread_id: event.thread_id,
                        start_ns,
                        end_ns: event.timestamp_ns,
                        duration_ns: event.timestamp_ns - start_ns,
                    });
                }
            }
        }
    }
    spans
}

pub fn pair_threads(records: &[ThreadRecord]) -> Vec<ThreadSpan> {
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|r| r.timestamp_ns);

    let mut open: HashMap<u32, usize> = HashMap::new();
    let mut spans: Vec<ThreadSpan> = Vec::new();
    for record in sorted {
        match record.phase() {
            Phase::Start => {
                open.insert(record.thread_id, spans.len());
                spans.push(ThreadSpan {
                    thread_id: record.thread_id,
                    start_ns: Some(record.timestamp_ns),
                    end_ns: None,
                    lifetime_ns: None,
                    spawn_stack: record.stack(),
                    spawn_frames: Vec::new(),
                });
            }
            Phase::End => match open.remove(&record.thread_id) {
                Some(idx) => {
                    let span = &mut spans[idx];
                    span.end_ns = Some(record.timestamp_ns);
                    span.lifetime_ns =
                        span.start_ns.map(|start| record.timestamp_ns.saturating_sub(start));
                }
                None => spans.push(ThreadSpan {
                    thread_id: record.thread_id,
                    start_ns: None,
                    end_ns: Some(record.timestamp_ns),
                    lifetime_ns: None,
                    spawn_stack: None,
                    spawn_frames: Vec::new(),
                }),
            },
        }
    }
    spans
}

/// Stacks still holding memory, largest first, with frames for the first `top`.
pub fn leak_sites(
    stacks: &[(StackId, AllocStats)],
    top: usize,
    mut frames: impl FnMut(StackId) -> Vec<String>,
) -> Vec<LeakSite> {
    let mut leaking: Vec<_> = stacks.iter().filter(|(_, s)| s.live_bytes() > 0).collect();
    leaking.sort_by(|(a_id, a), (b_id, b)| {
        b.live_bytes().cmp(&a.live_bytes()).then(a_id.cmp(b_id))
    });
    leaking
        .into_iter()
        .take(top)
        .map(|&(stack_id, stats)| LeakSite {
            stack_id,
            live_bytes: stats.live_bytes(),
            live_count: stats.live_count(),
            alloc_bytes: stats.alloc_bytes,
            free_bytes: stats.free_bytes,
            alloc_count: stats.alloc_count,
            free_count: stats.free_count,
            frames: frames(stack_id),
        })
        .collect()
}

fn cache_summaries(caches: &[(CacheName, AllocStats)]) -> Vec<CacheSummary> {
    let mut out: Vec<_> = caches
        .iter()
        .map(|(name, s)| CacheSummary {
            name: String::from_utf8_lossy(name.as_bytes()).into_owned(),
            alloc_bytes: s.alloc_bytes,
            free_bytes: s.free_bytes,
            alloc_count: s.alloc_count,
            free_count: s.free_count,
        })
        .collect();
    out.sort_by(|a, b| b.alloc_bytes.cmp(&a.alloc_bytes).then_with(|| a.name.cmp(&b.name)));
    out
}

impl Report {
    pub fn build(
        pid: u32,
        collected: &Collected,
        snapshot: &Snapshot,
        top: usize,
        mut frames: impl FnMut(StackId) -> Vec<String>,
    ) -> Self {
        // Stacks repeat across sections, resolve each one once.
        let mut resolved: HashMap<StackId, Vec<String>> = HashMap::new();
        let mut resolve = |id: StackId| {
            if id < 0 {
                return Vec::new();
            }
            resolved.entry(id).or_insert_with(|| frames(id)).clone()
        };

        let mut threads = pair_threads(&collected.threads);
        for span in &mut threads {
            if let Some(id) = span.spawn_stack {
                span.spawn_frames = resolve(id);
            }
        }
        Self {
            pid,
            phases: pair_phases(&collected.phases),
            threads,
            syscalls: collected.syscalls.summaries(top, &mut resolve),
            live_allocations: snapshot.live.len(),
            live_bytes: snapshot.live.iter().map(|(_, info)| info.size).sum(),
            leaks: leak_sites(&snapshot.stacks, top, &mut resolve),
            kernel_caches: cache_summaries(&snapshot.caches),
            anomalies: Anomaly::ALL
                .iter()
                .map(|&a| (a.name(), snapshot.anomalies[a as usize]))
                .collect(),
        }
    }

    pub fn log_summary(&self) {
        for (i, phase) in self.phases.iter().enumerate() {
            info!("phase {i} on tid {}: {} ns", phase.thread_id, phase.duration_ns);
        }
        info!(
            "{} threads, {} syscall kinds, {} live allocations ({} bytes)",
            self.threads.len(),
            self.syscalls.len(),
            self.live_allocations,
            self.live_bytes
        );
        for leak in self.leaks.iter().take(5) {
            info!(
                "stack {}: {} bytes live in {} allocations",
                leak.stack_id, leak.live_bytes, leak.live_count
            );
            for frame in &leak.frames {
                info!("    {frame}");
            }
        }
        for (name, count) in self.anomalies.iter().filter(|(_, c)| **c > 0) {
            info!("anomaly {name}: {count}");
        }
    }
}
