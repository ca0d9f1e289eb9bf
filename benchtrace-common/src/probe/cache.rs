use super::{Counters, Kernel, filter};
use crate::{Anomaly, CacheName, Side};

/// The `struct kmem_cache` an allocation or free went through.
pub trait CacheObject {
    /// `kmem_cache.size`: the slot each object takes, allocator metadata
    /// included.
    fn slot_size(&self) -> Option<u64>;

    fn name(&self) -> Option<CacheName>;
}

/// Per-cache alloc/free totals for kernel slab caches.
pub struct CacheCounter<'a, C> {
    pub stats: &'a C,
    /// Caches with slots smaller than this are skipped; 0 keeps everything.
    pub min_slot_size: u64,
}

impl<C: Counters<CacheName>> CacheCounter<'_, C> {
    #[inline(always)]
    pub fn alloc<K: Kernel, O: CacheObject>(&self, k: &K, cache: &O) {
        self.record(k, cache, Side::Alloc)
    }

    #[inline(always)]
    pub fn free<K: Kernel, O: CacheObject>(&self, k: &K, cache: &O) {
        self.record(k, cache, Side::Free)
    }

    #[inline(always)]
    fn record<K: Kernel, O: CacheObject>(&self, k: &K, cache: &O, side: Side) {
        if filter::current(k).is_none() {
            return;
        }
        let Some(size) = cache.slot_size() else {
            k.note(Anomaly::ReadFailed);
            return;
        };
        if size < self.min_slot_size {
            return;
        }
        let Some(name) = cache.name() else {
            k.note(Anomaly::ReadFailed);
            return;
        };
        if self.stats.add(&name, side, size).is_err() {
            k.note(Anomaly::TableFull);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AllocStats;
    use crate::probe::sim::{Host, SimCounters};

    struct Slab {
        name: &'static [u8],
        size: Option<u64>,
    }

    impl CacheObject for Slab {
        fn slot_size(&self) -> Option<u64> {
            self.size
        }

        fn name(&self) -> Option<CacheName> {
            Some(CacheName::from_bytes(self.name))
        }
    }

    #[test]
    fn counts_per_cache_name() {
        let host = Host::new(3);
        let stats = SimCounters::new(8);
        let counter = CacheCounter {
            stats: &stats,
            min_slot_size: 0,
        };
        let k = host.thread(3, 3);
        let dentry = Slab {
            name: b"dentry",
            size: Some(192),
        };
        let inode = Slab {
            name: b"inode_cache",
            size: Some(600),
        };

        counter.alloc(&k, &dentry);
        counter.alloc(&k, &dentry);
        counter.alloc(&k, &inode);
        counter.free(&k, &dentry);

        assert_eq!(
            stats.get(&CacheName::from_bytes(b"dentry")),
            Some(AllocStats {
                alloc_bytes: 384,
                free_bytes: 192,
                alloc_count: 2,
                free_count: 1,
            })
        );
        assert_eq!(
            stats.get(&CacheName::from_bytes(b"inode_cache")).map(|s| s.alloc_count),
            Some(1)
        );
    }

    #[test]
    fn small_objects_are_filtered() {
        let host = Host::new(3);
        let stats = SimCounters::new(8);
        let counter = CacheCounter {
            stats: &stats,
            min_slot_size: 256,
        };
        let k = host.thread(3, 3);
        let small = Slab {
            name: b"kmalloc-64",
            size: Some(64),
        };
        let large = Slab {
            name: b"kmalloc-512",
            size: Some(512),
        };
        counter.alloc(&k, &small);
        counter.alloc(&k, &large);
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn unreadable_cache_is_dropped() {
        let host = Host::new(3);
        let stats = SimCounters::new(8);
        let counter = CacheCounter {
            stats: &stats,
            min_slot_size: 0,
        };
        let unreadable = Slab {
            name: b"x",
            size: None,
        };
        counter.alloc(&host.thread(3, 3), &unreadable);
        assert_eq!(stats.len(), 0);
        assert_eq!(host.anomaly(Anomaly::ReadFailed), 1);
    }

    #[test]
    fn other_processes_are_ignored() {
        let host = Host::new(3);
        let stats = SimCounters::new(8);
        let counter = CacheCounter {
            stats: &stats,
            min_slot_size: 0,
        };
        let dentry = Slab {
            name: b"dentry",
            size: Some(192),
        };
        counter.alloc(&host.thread(4, 4), &dentry);
        assert_eq!(stats.len(), 0);
    }
}
