use crate::locator::current_foreground;
use crate::os::{Pid, Platform, ProcessHandle, ThreadInfo};
use crate::sampler::{sample_usage, Sample};
use crate::topology::{PreferredCluster, TopologyProfile};
use crate::util::cpu::AffinityMask;
use anyhow::Context;
use std::sync::Arc;

/// The process the controller currently manages.
pub struct ManagedProcessState<H> {
    process: H,
    pid: Pid,
    name: String,
    /// `None` until the first decision, which is then always applied.
    applied: Option<AffinityMask>,
    last_sample: Option<Sample>,
}

impl<H> ManagedProcessState<H> {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn applied(&self) -> Option<AffinityMask> {
        self.applied
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TickOutcome {
    /// No cluster layout is known, nothing is ever restricted.
    Disabled,
    NoForeground,
    /// A new foreground process is tracked, `restored` names the previous one
    /// if its affinity was reset.
    Adopted {
        pid: Pid,
        name: String,
        restored: Option<String>,
    },
    /// The process exited or its times couldn't be read.
    Unavailable { pid: Pid },
    Unchanged { pid: Pid, usage: f64 },
    Applied {
        pid: Pid,
        name: String,
        usage: f64,
        mask: AffinityMask,
        threads: usize,
    },
    Failed { pid: Pid, mask: AffinityMask },
    /// Affinity reset when the controller stopped managing the process.
    Released { pid: Pid, name: String },
}

impl TickOutcome {
    /// Line to report to the user, only for changed or restored affinities.
    pub fn status_line(&self) -> Option<String> {
        match self {
            TickOutcome::Adopted {
                restored: Some(name),
                ..
            }
            | TickOutcome::Released { name, .. } => Some(format!("Restore affinity: {}", name)),
            TickOutcome::Applied {
                name, usage, mask, ..
            } => Some(format!(
                "Process time: {:.2}, affinity: {:X}, name: {}",
                usage, mask, name
            )),
            _ => None,
        }
    }
}

/// Confines the foreground process to the preferred cluster while its usage
/// fits into a single one and lifts the restriction otherwise.
pub struct AffinityController<S: Platform> {
    system: S,
    profile: Arc<TopologyProfile>,
    preferred_cluster: Option<usize>,
    preferred_mask: Option<AffinityMask>,
    managed: Option<ManagedProcessState<S::Handle>>,
}

impl<S: Platform> AffinityController<S> {
    pub fn new<P: Into<Arc<TopologyProfile>>>(
        system: S,
        profile: P,
        preferred: PreferredCluster,
    ) -> Self {
        let profile = profile.into();
        let preferred_cluster = preferred.resolve(&profile);
        let preferred_mask = preferred_cluster.and_then(|cluster| profile.mask(cluster));

        Self {
            system,
            profile,
            preferred_cluster,
            preferred_mask,
            managed: None,
        }
    }

    #[inline]
    pub fn system(&self) -> &S {
        &self.system
    }

    #[inline]
    pub fn profile(&self) -> &TopologyProfile {
        &self.profile
    }

    /// 0-based cluster lightly loaded processes are confined to.
    #[inline]
    pub fn preferred_cluster(&self) -> Option<usize> {
        self.preferred_cluster
    }

    /// Mask of lightly loaded processes, `None` if nothing can be restricted.
    #[inline]
    pub fn preferred_mask(&self) -> Option<AffinityMask> {
        self.preferred_mask
    }

    #[inline]
    pub fn managed(&self) -> Option<&ManagedProcessState<S::Handle>> {
        self.managed.as_ref()
    }

    #[inline]
    pub fn managed_pid(&self) -> Option<Pid> {
        self.managed.as_ref().map(|managed| managed.pid)
    }

    /// One control step. Never fails, problems are logged and reported as
    /// outcome.
    pub fn tick(&mut self) -> TickOutcome {
        let preferred_mask = crate::some_or_return!(self.preferred_mask, || TickOutcome::Disabled);
        let process = crate::some_or_return!(current_foreground(&self.system), || {
            TickOutcome::NoForeground
        });

        if self.managed_pid() != Some(process.pid()) {
            return self.adopt(process);
        }

        self.decide(preferred_mask)
    }

    /// Stops managing the current process, lifting its restriction if one is
    /// applied.
    pub fn release(&mut self) -> Option<TickOutcome> {
        let managed = self.managed.take()?;
        match managed.applied {
            Some(mask) if mask != self.profile.full_mask() => {}
            _ => return None,
        }

        let name = self.restore(&managed)?;
        Some(TickOutcome::Released {
            pid: managed.pid,
            name,
        })
    }

    fn adopt(&mut self, process: S::Handle) -> TickOutcome {
        let restored = match self.managed.take() {
            Some(previous) => self.restore(&previous),
            None => None,
        };

        let pid = process.pid();
        let name = process.name();
        let last_sample = Sample::take(&process, self.system.now());
        log::debug!("tracking foreground process {} ({})", name, pid);

        self.managed = Some(ManagedProcessState {
            process,
            pid,
            name: name.clone(),
            applied: None,
            last_sample,
        });

        TickOutcome::Adopted {
            pid,
            name,
            restored,
        }
    }

    fn restore(&self, previous: &ManagedProcessState<S::Handle>) -> Option<String> {
        if previous.process.has_exited() {
            return None;
        }

        // every thread, one restricted while running may be waiting now
        match apply_mask(&previous.process, self.profile.full_mask(), |_| true) {
            Ok(threads) => {
                log::debug!(
                    "restored {} threads of {} ({})",
                    threads,
                    previous.name,
                    previous.pid
                );
                Some(previous.name.clone())
            }
            Err(e) => {
                log::warn!(
                    "failed to restore affinity of {} ({}): {:#}",
                    previous.name,
                    previous.pid,
                    e
                );
                None
            }
        }
    }

    fn decide(&mut self, preferred_mask: AffinityMask) -> TickOutcome {
        let now = self.system.now();
        let profile = &self.profile;
        let managed = crate::some_or_return!(self.managed.as_mut(), || TickOutcome::NoForeground);
        let pid = managed.pid;

        let last = match managed.last_sample {
            Some(last) => last,
            None => {
                managed.last_sample = Sample::take(&managed.process, now);
                return TickOutcome::Unavailable { pid };
            }
        };

        let (usage, sample) =
            match sample_usage(&managed.process, last, now, profile.logical_cores()) {
                Some(measured) => measured,
                None => return TickOutcome::Unavailable { pid },
            };
        managed.last_sample = Some(sample);

        let target = if usage.fits_single_cluster(profile.cluster_count()) {
            preferred_mask
        } else {
            profile.full_mask()
        };

        if managed.applied == Some(target) {
            return TickOutcome::Unchanged {
                pid,
                usage: usage.percent(),
            };
        }

        // recorded up front, a rejected write is not retried every tick
        managed.applied = Some(target);

        if managed.process.has_exited() {
            return TickOutcome::Unavailable { pid };
        }

        match apply_mask(&managed.process, target, ThreadInfo::is_running) {
            Ok(threads) => TickOutcome::Applied {
                pid,
                name: managed.name.clone(),
                usage: usage.percent(),
                mask: target,
                threads,
            },
            Err(e) => {
                log::warn!(
                    "failed to set affinity {} on {} ({}): {:#}",
                    target,
                    managed.name,
                    pid,
                    e
                );
                TickOutcome::Failed { pid, mask: target }
            }
        }
    }
}

/// Sets `mask` on the threads of `process` selected by `filter`, returns how
/// many were changed.
///
/// A thread that can't be changed, usually because it exited after the
/// snapshot, is logged and skipped. Fails only if no selected thread could be
/// changed.
fn apply_mask<P, F>(process: &P, mask: AffinityMask, filter: F) -> anyhow::Result<usize>
where
    P: ProcessHandle,
    F: Fn(&ThreadInfo) -> bool,
{
    let threads = process.threads().context("enumerating threads")?;

    let mut changed = 0;
    let mut first_error = None;
    for thread in threads.iter().filter(|thread| filter(thread)) {
        match process.set_thread_affinity(thread.tid, mask) {
            Ok(()) => changed += 1,
            Err(e) => {
                log::debug!(
                    "skipping thread {} of process {}: {:#}",
                    thread.tid.0,
                    process.pid(),
                    e
                );
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match first_error {
        Some(e) if changed == 0 => Err(e.context("no thread accepted the affinity")),
        _ => Ok(changed),
    }
}

#[cfg(test)]
mod tests {
    use super::{AffinityController, TickOutcome};
    use crate::os::mock::MockSystem;
    use crate::os::{Pid, ThreadState, Tid};
    use crate::topology::{PreferredCluster, TopologyProfile};
    use crate::util::cpu::AffinityMask;
    use std::time::Duration;

    const INTERVAL: Duration = Duration::from_millis(500);
    const CLUSTER_0: AffinityMask = AffinityMask::from_bits(0xFF);
    const CLUSTER_1: AffinityMask = AffinityMask::from_bits(0xFF00);
    const ALL: AffinityMask = AffinityMask::from_bits(0xFFFF);

    /// Zen 2, 16 logical cores in two clusters
    fn zen2_controller(preferred: usize) -> (MockSystem, AffinityController<MockSystem>) {
        let system = MockSystem::new();
        let profile = TopologyProfile::for_family(23, 16);
        let controller =
            AffinityController::new(system.clone(), profile, PreferredCluster::new(preferred));
        (system, controller)
    }

    /// One interval in which `pid` keeps `cores` logical cores busy.
    fn run(system: &MockSystem, pid: Pid, cores: f64) {
        system.advance(INTERVAL);
        system.consume(pid, INTERVAL.mul_f64(cores));
    }

    fn adopt(system: &MockSystem, controller: &mut AffinityController<MockSystem>, pid: Pid) {
        system.focus(pid);
        match controller.tick() {
            TickOutcome::Adopted { pid: adopted, .. } => assert_eq!(adopted, pid),
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    fn unknown_topology_never_restricts() {
        let system = MockSystem::new();
        let mut controller = AffinityController::new(
            system.clone(),
            TopologyProfile::empty(8),
            PreferredCluster::new(1),
        );
        assert_eq!(controller.preferred_mask(), None);

        let pid = system.spawn(10, "game.exe", 2, 0);
        system.focus(pid);
        for _ in 0..3 {
            run(&system, pid, 0.1);
            assert_eq!(controller.tick(), TickOutcome::Disabled);
        }
        assert_eq!(controller.managed_pid(), None);
        assert!(system.affinity_writes().is_empty());
    }

    #[test]
    fn missing_foreground_keeps_state() {
        let (system, mut controller) = zen2_controller(1);
        assert_eq!(controller.tick(), TickOutcome::NoForeground);
        assert_eq!(controller.managed_pid(), None);

        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);

        system.clear_focus();
        assert_eq!(controller.tick(), TickOutcome::NoForeground);
        system.focus_system_surface();
        assert_eq!(controller.tick(), TickOutcome::NoForeground);
        assert_eq!(controller.managed_pid(), Some(pid));
        assert!(system.affinity_writes().is_empty());
    }

    #[test]
    fn first_observation_takes_no_decision() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 1, 0);
        system.focus(pid);

        assert_eq!(
            controller.tick(),
            TickOutcome::Adopted {
                pid,
                name: "game.exe".to_owned(),
                restored: None,
            }
        );
        assert!(system.affinity_writes().is_empty());
        assert_eq!(controller.managed().unwrap().applied(), None);
    }

    #[test]
    fn light_load_is_confined_to_preferred_cluster() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 2, 1);
        adopt(&system, &mut controller, pid);

        run(&system, pid, 1.0);
        match controller.tick() {
            TickOutcome::Applied {
                mask,
                threads,
                usage,
                ..
            } => {
                assert_eq!(mask, CLUSTER_0);
                assert_eq!(threads, 2);
                assert!((usage - 6.25).abs() < 1e-9);
            }
            outcome => panic!("unexpected {:?}", outcome),
        }

        assert_eq!(system.thread_affinity(pid, Tid(1000)), Some(CLUSTER_0));
        assert_eq!(system.thread_affinity(pid, Tid(1001)), Some(CLUSTER_0));
        // not running, untouched
        assert_eq!(
            system.thread_affinity(pid, Tid(1002)),
            Some(AffinityMask::from_bits(u64::MAX))
        );
    }

    #[test]
    fn heavy_load_spans_all_clusters() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "render.exe", 1, 0);
        adopt(&system, &mut controller, pid);

        run(&system, pid, 8.0);
        match controller.tick() {
            TickOutcome::Applied { mask, .. } => assert_eq!(mask, ALL),
            outcome => panic!("unexpected {:?}", outcome),
        }

        run(&system, pid, 0.5);
        match controller.tick() {
            TickOutcome::Applied { mask, .. } => assert_eq!(mask, CLUSTER_0),
            outcome => panic!("unexpected {:?}", outcome),
        }
        assert_eq!(system.writes_for(pid).len(), 2);
    }

    #[test]
    fn unchanged_mask_is_not_reapplied() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);

        run(&system, pid, 1.0);
        assert!(controller.tick().status_line().is_some());
        assert_eq!(system.writes_for(pid).len(), 1);

        for load in &[0.5, 2.0, 0.0] {
            run(&system, pid, *load);
            let outcome = controller.tick();
            assert!(matches!(outcome, TickOutcome::Unchanged { .. }));
            assert_eq!(outcome.status_line(), None);
        }
        assert_eq!(system.writes_for(pid).len(), 1);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);

        // 1900ms per 500ms on 16 cores is 23.75%, the two cluster threshold
        system.advance(INTERVAL);
        system.consume(pid, Duration::from_millis(1900));
        match controller.tick() {
            TickOutcome::Applied { mask, .. } => assert_eq!(mask, CLUSTER_0),
            outcome => panic!("unexpected {:?}", outcome),
        }

        system.advance(INTERVAL);
        system.consume(pid, Duration::from_millis(1901));
        match controller.tick() {
            TickOutcome::Applied { mask, .. } => assert_eq!(mask, ALL),
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    fn preferred_cluster_is_clamped_to_detected_clusters() {
        let (system, mut controller) = zen2_controller(5);
        assert_eq!(controller.preferred_mask(), Some(CLUSTER_1));

        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);
        run(&system, pid, 1.0);
        match controller.tick() {
            TickOutcome::Applied { mask, .. } => assert_eq!(mask, CLUSTER_1),
            outcome => panic!("unexpected {:?}", outcome),
        }
    }

    #[test]
    fn switch_restores_previous_process() {
        let (system, mut controller) = zen2_controller(1);
        let first = system.spawn(10, "first.exe", 1, 1);
        let second = system.spawn(20, "second.exe", 1, 0);

        adopt(&system, &mut controller, first);
        run(&system, first, 1.0);
        controller.tick();
        assert_eq!(system.writes_for(first).len(), 1);

        system.clear_writes();
        system.focus(second);
        assert_eq!(
            controller.tick(),
            TickOutcome::Adopted {
                pid: second,
                name: "second.exe".to_owned(),
                restored: Some("first.exe".to_owned()),
            }
        );

        // the waiting thread is reset as well
        let restores = system.writes_for(first);
        assert_eq!(restores.len(), 2);
        assert!(restores.iter().all(|write| write.mask == ALL));
        assert!(system.writes_for(second).is_empty());

        // same decision as for the previous process, still applied
        run(&system, second, 1.0);
        match controller.tick() {
            TickOutcome::Applied { pid, mask, .. } => {
                assert_eq!(pid, second);
                assert_eq!(mask, CLUSTER_0);
            }
            outcome => panic!("unexpected {:?}", outcome),
        }
        assert_eq!(system.writes_for(first).len(), 2);
    }

    #[test]
    fn restore_reaches_threads_that_stopped_running() {
        let (system, mut controller) = zen2_controller(1);
        let first = system.spawn(10, "first.exe", 2, 0);
        let second = system.spawn(20, "second.exe", 1, 0);

        adopt(&system, &mut controller, first);
        run(&system, first, 1.0);
        assert!(matches!(controller.tick(), TickOutcome::Applied { threads: 2, .. }));
        assert_eq!(system.thread_affinity(first, Tid(1001)), Some(CLUSTER_0));

        system.set_thread_state(first, Tid(1001), ThreadState::NotRunning);
        system.focus(second);
        match controller.tick() {
            TickOutcome::Adopted { restored, .. } => {
                assert_eq!(restored.as_deref(), Some("first.exe"))
            }
            outcome => panic!("unexpected {:?}", outcome),
        }
        assert_eq!(system.thread_affinity(first, Tid(1000)), Some(ALL));
        assert_eq!(system.thread_affinity(first, Tid(1001)), Some(ALL));
    }

    #[test]
    fn vanished_thread_does_not_stop_the_others() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 3, 0);
        system.vanish_thread(pid, Tid(1000));
        adopt(&system, &mut controller, pid);

        run(&system, pid, 1.0);
        match controller.tick() {
            TickOutcome::Applied { mask, threads, .. } => {
                assert_eq!(mask, CLUSTER_0);
                assert_eq!(threads, 2);
            }
            outcome => panic!("unexpected {:?}", outcome),
        }
        assert_eq!(system.thread_affinity(pid, Tid(1001)), Some(CLUSTER_0));
        assert_eq!(system.thread_affinity(pid, Tid(1002)), Some(CLUSTER_0));
        assert_eq!(
            system.thread_affinity(pid, Tid(1000)),
            Some(AffinityMask::from_bits(u64::MAX))
        );

        run(&system, pid, 1.0);
        assert!(matches!(controller.tick(), TickOutcome::Unchanged { .. }));
    }

    #[test]
    fn exited_process_is_not_restored() {
        let (system, mut controller) = zen2_controller(1);
        let first = system.spawn(10, "first.exe", 1, 0);
        let second = system.spawn(20, "second.exe", 1, 0);

        adopt(&system, &mut controller, first);
        run(&system, first, 1.0);
        controller.tick();
        system.clear_writes();

        system.exit(first);
        system.focus(second);
        match controller.tick() {
            TickOutcome::Adopted { restored, .. } => assert_eq!(restored, None),
            outcome => panic!("unexpected {:?}", outcome),
        }
        assert!(system.affinity_writes().is_empty());
    }

    #[test]
    fn exited_foreground_process_is_skipped() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);

        run(&system, pid, 1.0);
        system.exit(pid);
        assert_eq!(controller.tick(), TickOutcome::NoForeground);
        assert_eq!(controller.managed_pid(), Some(pid));
        assert!(system.affinity_writes().is_empty());
    }

    #[test]
    fn empty_interval_is_unavailable() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);

        assert_eq!(controller.tick(), TickOutcome::Unavailable { pid });
        assert!(system.affinity_writes().is_empty());

        run(&system, pid, 1.0);
        assert!(matches!(controller.tick(), TickOutcome::Applied { .. }));
    }

    #[test]
    fn rejected_write_is_not_fatal() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "protected.exe", 1, 0);
        system.deny_affinity(pid);
        adopt(&system, &mut controller, pid);

        run(&system, pid, 1.0);
        assert_eq!(
            controller.tick(),
            TickOutcome::Failed {
                pid,
                mask: CLUSTER_0
            }
        );

        run(&system, pid, 1.0);
        assert!(matches!(controller.tick(), TickOutcome::Unchanged { .. }));

        run(&system, pid, 8.0);
        assert_eq!(controller.tick(), TickOutcome::Failed { pid, mask: ALL });
        assert!(system.affinity_writes().is_empty());
    }

    #[test]
    fn release_lifts_restriction() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "game.exe", 1, 0);
        adopt(&system, &mut controller, pid);
        run(&system, pid, 1.0);
        controller.tick();

        assert_eq!(
            controller.release(),
            Some(TickOutcome::Released {
                pid,
                name: "game.exe".to_owned()
            })
        );
        assert_eq!(system.thread_affinity(pid, Tid(1000)), Some(ALL));
        assert_eq!(controller.managed_pid(), None);
        assert_eq!(controller.release(), None);
    }

    #[test]
    fn release_reaches_waiting_threads() {
        let (system, mut controller) = zen2_controller(2);
        let pid = system.spawn(10, "game.exe", 2, 0);
        adopt(&system, &mut controller, pid);
        run(&system, pid, 1.0);
        controller.tick();

        system.set_thread_state(pid, Tid(1000), ThreadState::NotRunning);
        system.set_thread_state(pid, Tid(1001), ThreadState::NotRunning);
        assert!(controller.release().is_some());
        assert_eq!(system.thread_affinity(pid, Tid(1000)), Some(ALL));
        assert_eq!(system.thread_affinity(pid, Tid(1001)), Some(ALL));
    }

    #[test]
    fn preferred_cluster_is_resolved_once() {
        let (_, controller) = zen2_controller(2);
        assert_eq!(controller.preferred_cluster(), Some(1));

        let (_, clamped) = zen2_controller(4);
        assert_eq!(clamped.preferred_cluster(), Some(1));

        let disabled = AffinityController::new(
            MockSystem::new(),
            TopologyProfile::empty(8),
            PreferredCluster::new(1),
        );
        assert_eq!(disabled.preferred_cluster(), None);
    }

    #[test]
    fn release_without_restriction() {
        let (system, mut controller) = zen2_controller(1);
        let pid = system.spawn(10, "render.exe", 1, 0);
        adopt(&system, &mut controller, pid);
        assert_eq!(controller.release(), None);

        adopt(&system, &mut controller, pid);
        run(&system, pid, 8.0);
        controller.tick();
        system.clear_writes();
        assert_eq!(controller.release(), None);
        assert!(system.affinity_writes().is_empty());
    }

    #[test]
    fn status_lines() {
        let applied = TickOutcome::Applied {
            pid: Pid(10),
            name: "game.exe".to_owned(),
            usage: 6.25,
            mask: AffinityMask::from_bits(0xFFF000),
            threads: 3,
        };
        assert_eq!(
            applied.status_line().unwrap(),
            "Process time: 6.25, affinity: FFF000, name: game.exe"
        );

        let restored = TickOutcome::Adopted {
            pid: Pid(20),
            name: "other.exe".to_owned(),
            restored: Some("game.exe".to_owned()),
        };
        assert_eq!(
            restored.status_line().unwrap(),
            "Restore affinity: game.exe"
        );

        let adopted = TickOutcome::Adopted {
            pid: Pid(20),
            name: "other.exe".to_owned(),
            restored: None,
        };
        assert_eq!(adopted.status_line(), None);
        assert_eq!(TickOutcome::NoForeground.status_line(), None);
    }
}
