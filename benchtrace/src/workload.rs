use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use log::info;

use crate::store::{Key, PlainHash, Store};

/// Options of `benchtrace workload`.
#[derive(Debug, Clone, clap::Args)]
pub struct WorkloadConfig {
    /// Directory of the store's data file
    #[arg(long, default_value = "benchtrace-db")]
    pub dir: PathBuf,

    /// Total operations across all threads
    #[arg(long, default_value = "100000")]
    pub ops: u64,

    /// Distinct keys touched
    #[arg(long, default_value = "10000")]
    pub keys: u64,

    #[arg(long, default_value = "100")]
    pub value_size: usize,

    #[arg(long, default_value = "4")]
    pub threads: usize,

    /// Seconds to wait before the measured phase so a tracer can attach
    #[arg(long, default_value = "0")]
    pub delay: u64,
}

/// Marks the start of the measured phase. Probed by `benchtrace trace`.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn benchtrace_phase_start() {
    std::hint::black_box(());
}

/// Marks the end of the measured phase.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn benchtrace_phase_end() {
    std::hint::black_box(());
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub upserts: u64,
    pub reads: u64,
    pub updates: u64,
    pub removes: u64,
    pub misses: u64,
}

impl Summary {
    pub fn total(&self) -> u64 {
        self.upserts + self.reads + self.updates + self.removes
    }

    fn merge(mut self, other: Summary) -> Summary {
        self.upserts += other.upserts;
        self.reads += other.reads;
        self.updates += other.updates;
        self.removes += other.removes;
        self.misses += other.misses;
        self
    }
}

/// Scrambles the op index over the key space.
fn key_of(op: u64, keys: u64) -> Key {
    op.wrapping_mul(0x9e37_79b9_7f4a_7c15) % keys
}

fn worker<S: Store>(store: &S, config: &WorkloadConfig, first: u64, count: u64) -> Summary {
    let mut summary = Summary::default();
    let mut buf = Vec::with_capacity(config.value_size);
    for op in first..first + count {
        let key = key_of(op, config.keys);
        let result = match op % 4 {
            0 => {
                summary.upserts += 1;
                let value = vec![(op & 0xff) as u8; config.value_size];
                store.upsert(key, &value)
            }
            1 => {
                summary.reads += 1;
                store.read(key, &mut buf)
            }
            2 => {
                summary.updates += 1;
                let value = vec![!(op & 0xff) as u8; config.value_size];
                store.update(key, &value)
            }
            _ => {
                summary.removes += 1;
                store.remove(key)
            }
        };
        if !result.is_ok() {
            summary.misses += 1;
        }
    }
    summary
}

/// Runs `work(t)` for every `t` in `0..threads` on scoped threads and
/// merges the results.
fn run_threads<F>(threads: u64, work: F) -> Result<Summary>
where
    F: Fn(u64) -> Summary + Sync,
{
    thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let work = &work;
                s.spawn(move || work(t))
            })
            .collect();
        // Every thread is joined before failing, or the scope would panic.
        let parts: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        parts.into_iter().try_fold(Summary::default(), |acc, part| {
            part.map(|p| acc.merge(p))
                .map_err(|_| anyhow!("workload thread panicked"))
        })
    })
}

pub fn run(config: &WorkloadConfig) -> Result<Summary> {
    if config.threads == 0 || config.keys == 0 {
        bail!("--threads and --keys must be positive");
    }
    let store = PlainHash::open(&config.dir)?;
    if config.delay > 0 {
        info!("pid {}: starting in {}s", std::process::id(), config.delay);
        thread::sleep(Duration::from_secs(config.delay));
    }

    let threads = config.threads as u64;
    let per_thread = config.ops / threads;
    let started = Instant::now();
    benchtrace_phase_start();
    let summary = run_threads(threads, |t| {
        let count = if t == threads - 1 {
            config.ops - per_thread * t
        } else {
            per_thread
        };
        worker(&store, config, t * per_thread, count)
    });
    benchtrace_phase_end();
    let elapsed = started.elapsed();
    let summary = summary?;

    store.flush()?;
    info!(
        "{} ops in {:?} ({} misses), {} entries, {} bytes on disk",
        summary.total(),
        elapsed,
        summary.misses,
        store.len(),
        store.size_on_disk()
    );
    Ok(summary)
}
