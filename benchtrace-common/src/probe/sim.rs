//! Host stand-ins for the kernel boundary and the BPF maps.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{Counters, Full, Kernel, Ring, Table};
use crate::{AllocStats, Anomaly, Side, StackId, UNKNOWN_STACK};

pub(crate) struct Host {
    target: u32,
    clock: AtomicU64,
    diagnostics: AtomicBool,
    stacks: StackInterner,
    user: Mutex<HashMap<u64, u64>>,
    anomalies: [AtomicU64; Anomaly::COUNT as usize],
}

impl Host {
    pub(crate) fn new(target: u32) -> Self {
        Self::with_stack_capacity(target, 1024)
    }

    pub(crate) fn with_stack_capacity(target: u32, capacity: usize) -> Self {
        Self {
            target,
            clock: AtomicU64::new(0),
            diagnostics: AtomicBool::new(true),
            stacks: StackInterner::new(capacity),
            user: Mutex::new(HashMap::new()),
            anomalies: Default::default(),
        }
    }

    pub(crate) fn thread(&self, pid: u32, tid: u32) -> Invocation<'_> {
        Invocation {
            host: self,
            pid_tgid: ((pid as u64) << 32) | tid as u64,
            stack: Vec::new(),
        }
    }

    pub(crate) fn set_clock(&self, ns: u64) {
        self.clock.store(ns, Ordering::SeqCst);
    }

    pub(crate) fn set_diagnostics(&self, enabled: bool) {
        self.diagnostics.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn write_user(&self, addr: u64, value: u64) {
        self.user.lock().unwrap().insert(addr, value);
    }

    pub(crate) fn anomaly(&self, anomaly: Anomaly) -> u64 {
        self.anomalies[anomaly as usize].load(Ordering::SeqCst)
    }

    /// Id of an already interned stack.
    pub(crate) fn stack_id(&self, frames: &[u64]) -> Option<StackId> {
        self.stacks.lookup(frames)
    }

    pub(crate) fn resident_stacks(&self) -> usize {
        self.stacks.len()
    }
}

/// One probe invocation on behalf of a given thread.
pub(crate) struct Invocation<'a> {
    host: &'a Host,
    pid_tgid: u64,
    stack: Vec<u64>,
}

impl Invocation<'_> {
    pub(crate) fn with_stack(mut self, frames: &[u64]) -> Self {
        self.stack = frames.to_vec();
        self
    }
}

impl Kernel for Invocation<'_> {
    fn target_pid(&self) -> u32 {
        self.host.target
    }

    fn pid_tgid(&self) -> u64 {
        self.pid_tgid
    }

    fn ktime_ns(&self) -> u64 {
        self.host.clock.load(Ordering::SeqCst)
    }

    fn user_stack_id(&self) -> StackId {
        self.host.stacks.intern(&self.stack)
    }

    fn read_user_u64(&self, addr: u64) -> Option<u64> {
        self.host.user.lock().unwrap().get(&addr).copied()
    }

    fn diagnostics(&self) -> bool {
        self.host.diagnostics.load(Ordering::SeqCst)
    }

    fn note(&self, anomaly: Anomaly) {
        self.host.anomalies[anomaly as usize].fetch_add(1, Ordering::SeqCst);
    }
}

/// Open-addressed stack table keyed by content hash. Slots are never evicted
/// and the slot index is the id.
pub(crate) struct StackInterner {
    slots: Mutex<Vec<Option<Vec<u64>>>>,
}

impl StackInterner {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
        }
    }

    fn home(frames: &[u64], capacity: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        frames.hash(&mut hasher);
        (hasher.finish() % capacity as u64) as usize
    }

    pub(crate) fn intern(&self, frames: &[u64]) -> StackId {
        let mut slots = self.slots.lock().unwrap();
        let capacity = slots.len();
        if capacity == 0 {
            return UNKNOWN_STACK;
        }
        let home = Self::home(frames, capacity);
        for probe in 0..capacity {
            let idx = (home + probe) % capacity;
            if slots[idx].is_none() {
                slots[idx] = Some(frames.to_vec());
                return idx as StackId;
            }
            if slots[idx].as_deref() == Some(frames) {
                return idx as StackId;
            }
        }
        UNKNOWN_STACK
    }

    pub(crate) fn lookup(&self, frames: &[u64]) -> Option<StackId> {
        let slots = self.slots.lock().unwrap();
        let capacity = slots.len();
        if capacity == 0 {
            return None;
        }
        let home = Self::home(frames, capacity);
        (0..capacity)
            .map(|probe| (home + probe) % capacity)
            .take_while(|&idx| slots[idx].is_some())
            .find(|&idx| slots[idx].as_deref() == Some(frames))
            .map(|idx| idx as StackId)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }
}

pub(crate) struct SimTable<K, V> {
    capacity: usize,
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Hash + Eq + Copy, V: Copy> SimTable<K, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        self.entries.lock().unwrap().keys().copied().collect()
    }
}

impl<K: Hash + Eq + Copy, V: Copy> Table<K, V> for SimTable<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().unwrap().get(key).copied()
    }

    fn insert(&self, key: &K, value: &V) -> Result<(), Full> {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(key) && entries.len() >= self.capacity {
            return Err(Full);
        }
        entries.insert(*key, *value);
        Ok(())
    }

    fn remove(&self, key: &K) -> bool {
        self.entries.lock().unwrap().remove(key).is_some()
    }
}

pub(crate) struct SimRing<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
}

impl<T: Copy> SimRing<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        self.items.lock().unwrap().drain(..).collect()
    }
}

impl<T: Copy> Ring<T> for SimRing<T> {
    fn push(&self, item: &T) -> Result<(), Full> {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return Err(Full);
        }
        items.push_back(*item);
        Ok(())
    }
}

#[derive(Default)]
struct AtomicStats {
    alloc_bytes: AtomicU64,
    free_bytes: AtomicU64,
    alloc_count: AtomicU64,
    free_count: AtomicU64,
}

/// Buckets are assigned under a lock but updated lock-free, like map values
/// the kernel hands out by pointer.
pub(crate) struct SimCounters<K> {
    index: Mutex<HashMap<K, usize>>,
    buckets: Box<[AtomicStats]>,
}

impl<K: Hash + Eq + Copy> SimCounters<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            buckets: (0..capacity).map(|_| AtomicStats::default()).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub(crate) fn get(&self, key: &K) -> Option<AllocStats> {
        let idx = *self.index.lock().unwrap().get(key)?;
        let b = &self.buckets[idx];
        Some(AllocStats {
            alloc_bytes: b.alloc_bytes.load(Ordering::SeqCst),
            free_bytes: b.free_bytes.load(Ordering::SeqCst),
            alloc_count: b.alloc_count.load(Ordering::SeqCst),
            free_count: b.free_count.load(Ordering::SeqCst),
        })
    }

    fn bucket(&self, key: &K) -> Option<&AtomicStats> {
        let mut index = self.index.lock().unwrap();
        let next = index.len();
        let idx = match index.get(key).copied() {
            Some(idx) => idx,
            None if next < self.buckets.len() => {
                index.insert(*key, next);
                next
            }
            None => return None,
        };
        Some(&self.buckets[idx])
    }
}

impl<K: Hash + Eq + Copy> Counters<K> for SimCounters<K> {
    fn add(&self, key: &K, side: Side, bytes: u64) -> Result<(), Full> {
        let bucket = self.bucket(key).ok_or(Full)?;
        let (total, count) = match side {
            Side::Alloc => (&bucket.alloc_bytes, &bucket.alloc_count),
            Side::Free => (&bucket.free_bytes, &bucket.free_count),
        };
        total.fetch_add(bytes, Ordering::Relaxed);
        count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_stacks_share_an_id() {
        let stacks = StackInterner::new(64);
        let a = stacks.intern(&[1, 2, 3]);
        let b = stacks.intern(&[1, 2, 3]);
        let c = stacks.intern(&[1, 2, 4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(stacks.len(), 2);
    }

    #[test]
    fn overflow_yields_unknown_without_evicting() {
        let capacity = 16;
        let host = Host::with_stack_capacity(1, capacity);
        let mut ids = Vec::new();
        for frame in 0..=capacity as u64 {
            ids.push(host.thread(1, 1).with_stack(&[frame, frame + 1]).user_stack_id());
        }
        assert_eq!(host.resident_stacks(), capacity);
        assert!(ids[..capacity].iter().all(|&id| id != UNKNOWN_STACK));
        assert_eq!(ids[capacity], UNKNOWN_STACK);
        // Residents keep their ids.
        assert_eq!(host.stack_id(&[0, 1]), Some(ids[0]));
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        const WRITERS: u64 = 8;
        const ROUNDS: u64 = 10_000;
        const SIZE: u64 = 24;
        let counters = SimCounters::<StackId>::new(4);

        std::thread::scope(|s| {
            for _ in 0..WRITERS {
                s.spawn(|| {
                    for _ in 0..ROUNDS {
                        counters.add(&42, Side::Alloc, SIZE).unwrap();
                    }
                });
            }
        });

        let stats = counters.get(&42).unwrap();
        assert_eq!(stats.alloc_count, WRITERS * ROUNDS);
        assert_eq!(stats.alloc_bytes, WRITERS * ROUNDS * SIZE);
    }
}
