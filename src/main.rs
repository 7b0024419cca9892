use anyhow::Context;
use autoccx::prelude::*;
use clap::Parser;
use std::time::Duration;

/// Keeps the foreground application on a single core complex (CCX) while it
/// is lightly loaded.
#[derive(Parser, Debug)]
#[command(name = "autoccx", version)]
struct Args {
    /// Preferred CCX, 1 to 4. Anything else selects the first one.
    #[arg(value_name = "PREFERRED", default_value = "1")]
    preferred: PreferredCluster,

    /// Delay between two control steps, in milliseconds.
    #[arg(long, default_value_t = 500)]
    interval_ms: u64,

    /// Processor identification string, e.g. "AMD64 Family 25 Model 33 Stepping 0".
    #[arg(long, env = "PROCESSOR_IDENTIFIER")]
    cpu_identifier: Option<String>,

    /// Number of logical cores, detected if not given.
    #[arg(long)]
    logical_cores: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let identifier = args
        .cpu_identifier
        .as_deref()
        .context("no processor identifier, set PROCESSOR_IDENTIFIER or pass --cpu-identifier")?;
    let logical_cores = match args.logical_cores {
        Some(cores) => cores,
        None => autoccx::logical_core_count().context("unable to detect the logical core count")?,
    };

    let profile = TopologyProfile::resolve(identifier, logical_cores)?;
    println!("Detected CCX count: {}", profile.cluster_count());
    println!("Cores per CCX: {}", profile.cores_per_cluster());
    if profile.is_empty() {
        log::warn!(
            "no known CCX layout for {:?} with {} logical cores, affinities stay untouched",
            identifier,
            logical_cores
        );
    }

    start(profile, args.preferred, Duration::from_millis(args.interval_ms))
}

#[cfg(windows)]
fn print_status(outcome: &TickOutcome) {
    if let Some(line) = outcome.status_line() {
        println!("{}", line);
    }
}

#[cfg(windows)]
fn start(
    profile: TopologyProfile,
    preferred: PreferredCluster,
    poll_interval: Duration,
) -> anyhow::Result<()> {
    use autoccx::os::windows::Win32System;

    let autoccx = AutoCcx::builder(Win32System::new(), profile)
        .with_preferred_cluster(preferred)
        .with_poll_interval(poll_interval)
        .finish();

    match autoccx.preferred_cluster() {
        Some(cluster) => println!("Starting AutoCCX, preferred CCX: {}", cluster + 1),
        None => println!("Starting AutoCCX, no CCX to prefer"),
    }

    let shutdown_switch = autoccx.get_shutdown_switch();
    ctrlc::set_handler(move || {
        shutdown_switch.request_shutdown();
    })
    .context("installing the termination handler")?;

    autoccx.start(print_status);
    Ok(())
}

#[cfg(not(windows))]
fn start(
    _profile: TopologyProfile,
    _preferred: PreferredCluster,
    _poll_interval: Duration,
) -> anyhow::Result<()> {
    anyhow::bail!("foreground window tracking is only supported on Windows")
}
