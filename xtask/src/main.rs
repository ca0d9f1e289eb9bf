use std::process::Command;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};

const EBPF_PACKAGE: &str = "benchtrace-ebpf";

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the eBPF object on its own
    BuildEbpf {
        #[arg(short, long)]
        release: bool,
    },
    /// Build the eBPF object, then the collector
    BuildAll {
        #[arg(short, long)]
        release: bool,
    },
    /// Run the host-side test suites
    Test,
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Commands::BuildEbpf { release } => build_ebpf(release),
        Commands::BuildAll { release } => {
            build_ebpf(release)?;
            cargo("collector build", &with_release(&["build", "-p", "benchtrace"], release))
        }
        Commands::Test => cargo(
            "tests",
            &["test", "-p", "benchtrace-common", "-p", "benchtrace"],
        ),
    }
}

fn with_release<'a>(args: &[&'a str], release: bool) -> Vec<&'a str> {
    let mut args = args.to_vec();
    if release {
        args.push("--release");
    }
    args
}

fn build_ebpf(release: bool) -> Result<()> {
    let args = with_release(
        &[
            "+nightly",
            "build",
            "-Z",
            "build-std=core",
            "--target",
            "bpfel-unknown-none",
        ],
        release,
    );
    let status = Command::new("cargo").current_dir(EBPF_PACKAGE).args(&args).status()?;
    if !status.success() {
        bail!("{EBPF_PACKAGE} build failed");
    }
    println!("{EBPF_PACKAGE} built");
    Ok(())
}

fn cargo(what: &str, args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        bail!("{what} failed");
    }
    println!("{what} done");
    Ok(())
}
