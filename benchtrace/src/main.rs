mod collector;
mod config;
mod report;
mod store;
mod symbolize;
mod tracefs;
mod workload;

use std::fs;

use anyhow::Context as _;
use clap::Parser;
use log::debug;

use crate::config::TraceConfig;
use crate::workload::WorkloadConfig;

#[derive(clap::Parser)]
#[command(about = "Trace allocations, syscalls and threads of a benchmark run")]
struct Opt {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Attach to a running process and report what it did
    Trace(TraceConfig),
    /// Drive the bundled key-value store between the phase markers
    Workload(WorkloadConfig),
}

fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::parse();

    match opt.cmd {
        Command::Trace(config) => {
            config.validate()?;
            bump_memlock_rlimit();
            let report = collector::run(&config).await?;
            report.log_summary();

            let json = serde_json::to_string_pretty(&report)?;
            match &config.output {
                Some(path) => fs::write(path, json)
                    .with_context(|| format!("writing report to {}", path.display()))?,
                None => println!("{json}"),
            }
        }
        Command::Workload(config) => {
            tokio::task::spawn_blocking(move || workload::run(&config)).await??;
        }
    }
    Ok(())
}
