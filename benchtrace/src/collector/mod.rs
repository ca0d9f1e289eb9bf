use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context as _, Result, bail};
use aya::{
    Ebpf, EbpfLoader,
    maps::{MapData, StackTraceMap},
};
use benchtrace_common::{KmemLayout, StackId, names};
use log::{info, warn};
use proc_maps::Pid;
use tokio::task;

use crate::config::TraceConfig;
use crate::report::{Collected, Report};
use crate::symbolize::ustack;
use crate::tracefs::{self, Tracefs};

pub mod attach;
pub mod drain;

use attach::Attacher;
use drain::Tables;

pub fn stacktrace_from_id(map: &StackTraceMap<MapData>, id: StackId) -> Vec<u64> {
    if id < 0 {
        return Vec::new();
    }
    map.get(&(id as u32), 0)
        .map(|t| t.frames().iter().map(|f| f.ip).collect())
        .unwrap_or_default()
}

fn kmem_layout(config: &TraceConfig) -> KmemLayout {
    let mut base = KmemLayout {
        page_shift: tracefs::page_shift(),
        ..KmemLayout::DEFAULT
    };
    if let Some(offset) = config.kmem_cache_size_offset {
        base.kmem_cache_size = offset;
    }
    if let Some(offset) = config.kmem_cache_name_offset {
        base.kmem_cache_name = offset;
    }
    if !config.memory {
        return base;
    }
    match Tracefs::find() {
        Some(fs) => fs.kmem_layout(base),
        None => {
            warn!("tracefs not mounted, using built-in kmem tracepoint offsets");
            base
        }
    }
}

fn load(config: &TraceConfig, layout: &KmemLayout) -> Result<Ebpf> {
    let diagnostics = u8::from(config.diagnostics);
    let mut loader = EbpfLoader::new();
    loader
        .set_global(names::TARGET_PID, &config.pid, true)
        .set_global(names::MIN_CACHE_OBJECT_SIZE, &config.min_cache_object_size, true)
        .set_global(names::DIAGNOSTICS_ENABLED, &diagnostics, true)
        .set_global(names::KMEM_LAYOUT, layout, true);
    for (map, entries) in config.capacities.by_map() {
        loader.set_max_entries(map, entries);
    }
    loader
        .load(aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/benchtrace")))
        .context("loading the eBPF object")
}

pub async fn run(config: &TraceConfig) -> Result<Report> {
    if !Path::new(&format!("/proc/{}", config.pid)).exists() {
        bail!("no process with pid {}", config.pid);
    }

    let layout = kmem_layout(config);
    let mut ebpf = load(config, &layout)?;
    Attacher::new(&mut ebpf, config.pid).attach_all(config)?.log();
    let mut tables = Tables::take(&mut ebpf, &config.capacities)?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, finishing up");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    let deadline = config.run_for().map(|d| Instant::now() + d);
    let interval = config.interval();
    info!("tracing pid {}", config.pid);

    let (tables, collected) = task::spawn_blocking(move || {
        let mut collected = Collected::default();
        loop {
            std::thread::sleep(interval);
            tables.drain(&mut collected);
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if expired || stop.load(Ordering::Relaxed) {
                break;
            }
        }
        (tables, collected)
    })
    .await?;

    info!(
        "collected {} phase markers, {} thread events, {} syscalls",
        collected.phases.len(),
        collected.threads.len(),
        collected.syscalls.count()
    );
    let snapshot = tables.snapshot();
    let resolver = match ustack::Resolver::new(config.pid as Pid) {
        Ok(resolver) => Some(resolver),
        Err(e) => {
            warn!("cannot symbolize pid {}: {e}", config.pid);
            None
        }
    };
    let report = Report::build(config.pid, &collected, &snapshot, config.top, |id| {
        let addrs = stacktrace_from_id(&tables.stacks, id);
        match &resolver {
            Some(resolver) => resolver.describe(&addrs),
            None => addrs.iter().map(|a| format!("0x{a:x}")).collect(),
        }
    });

    // Programs stay attached until the report is assembled.
    drop(ebpf);
    Ok(report)
}
