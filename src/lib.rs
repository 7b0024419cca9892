use crate::controller::{AffinityController, TickOutcome};
use crate::os::Platform;
use crate::schedule::{ControlLoop, ShutdownSwitch, DEFAULT_POLL_INTERVAL};
use crate::topology::{PreferredCluster, TopologyProfile};
use std::sync::Arc;
use std::time::Duration;

pub mod controller;
pub mod locator;
pub mod os;
pub mod prelude;
pub mod sampler;
pub mod schedule;
pub mod topology;
mod util;

pub use crate::util::cpu::{logical_core_count, AffinityMask};

pub struct AutoCcxBuilder<S: Platform> {
    system: S,
    profile: Arc<TopologyProfile>,
    preferred: PreferredCluster,
    poll_interval: Duration,
}

impl<S: Platform> AutoCcxBuilder<S> {
    pub fn with_preferred_cluster(mut self, preferred: PreferredCluster) -> Self {
        self.preferred = preferred;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn finish(self) -> AutoCcx<S> {
        let controller = AffinityController::new(self.system, self.profile, self.preferred);
        AutoCcx {
            control_loop: ControlLoop::new(controller, self.poll_interval),
        }
    }
}

/// Keeps the foreground process on a single core complex while it is lightly
/// loaded.
pub struct AutoCcx<S: Platform> {
    control_loop: ControlLoop<S>,
}

impl<S: Platform> AutoCcx<S> {
    pub fn builder<P: Into<Arc<TopologyProfile>>>(system: S, profile: P) -> AutoCcxBuilder<S> {
        AutoCcxBuilder {
            system,
            profile: profile.into(),
            preferred: PreferredCluster::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn get_shutdown_switch(&self) -> ShutdownSwitch {
        self.control_loop.get_shutdown_switch()
    }

    /// 0-based cluster lightly loaded processes are confined to, `None` if
    /// the topology is unknown.
    pub fn preferred_cluster(&self) -> Option<usize> {
        self.control_loop.controller().preferred_cluster()
    }

    /// Blocks until shutdown is requested through the [`ShutdownSwitch`].
    pub fn start<F: FnMut(&TickOutcome)>(self, observe: F) {
        log::info!("start autoccx");
        self.control_loop.run(observe);
    }
}
