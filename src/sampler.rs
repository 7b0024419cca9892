use crate::os::ProcessHandle;
use std::time::{Duration, Instant};

/// Share of the capacity a cluster is expected to cover, in percent.
const CLUSTER_SHARE_PERCENT: u128 = 95;

/// Accumulated processor time of a process at a point in wall clock time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Sample {
    pub at: Instant,
    pub cpu_time: Duration,
}

impl Sample {
    /// `None` if the process has exited or its times can't be read.
    pub fn take<P: ProcessHandle>(process: &P, at: Instant) -> Option<Self> {
        if process.has_exited() {
            return None;
        }

        match process.cpu_time() {
            Ok(cpu_time) => Some(Self { at, cpu_time }),
            Err(e) => {
                log::debug!("no processor time for {}: {:#}", process.pid(), e);
                None
            }
        }
    }
}

/// Processor time consumed during a wall clock interval, relative to the
/// capacity of all logical cores.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CpuUsage {
    cpu: Duration,
    wall: Duration,
    logical_cores: usize,
}

impl CpuUsage {
    /// `None` for an empty interval or a machine without cores.
    pub fn new(cpu: Duration, wall: Duration, logical_cores: usize) -> Option<Self> {
        if wall == Duration::default() || logical_cores == 0 {
            return None;
        }

        Some(Self {
            cpu,
            wall,
            logical_cores,
        })
    }

    /// Usage in percent of the whole machine, 100 meaning every core was busy.
    pub fn percent(&self) -> f64 {
        self.cpu.as_secs_f64() / self.wall.as_secs_f64() / self.logical_cores as f64 * 100.0
    }

    /// Whether the usage stays at or below [`single_cluster_threshold`].
    ///
    /// `cpu / wall / cores * 100 <= 0.5 / clusters * 95`, compared exactly.
    pub fn fits_single_cluster(&self, clusters: usize) -> bool {
        if clusters == 0 {
            return false;
        }

        let lhs = self.cpu.as_nanos() * 100 * 2 * clusters as u128;
        let rhs = self.wall.as_nanos() * self.logical_cores as u128 * CLUSTER_SHARE_PERCENT;
        lhs <= rhs
    }
}

/// Highest usage, in percent of the whole machine, a process may have to be
/// confined to a single cluster out of `clusters`.
#[inline]
pub fn single_cluster_threshold(clusters: usize) -> f64 {
    (0.5 / clusters as f64) * CLUSTER_SHARE_PERCENT as f64
}

/// Measures the usage of `process` since `last`, returning it together with
/// the sample to measure against next time.
///
/// `None` if the process exited in between or no time has passed.
pub fn sample_usage<P: ProcessHandle>(
    process: &P,
    last: Sample,
    now: Instant,
    logical_cores: usize,
) -> Option<(CpuUsage, Sample)> {
    let current = Sample::take(process, now)?;
    let wall = current.at.checked_duration_since(last.at)?;
    let cpu = current.cpu_time.checked_sub(last.cpu_time).unwrap_or_default();
    let usage = CpuUsage::new(cpu, wall, logical_cores)?;
    Some((usage, current))
}
