use crate::controller::{AffinityController, TickOutcome};
use crate::os::Platform;
use parking_lot::{Condvar, Mutex};
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct ShutdownState {
    requested: Mutex<bool>,
    wakeup: Condvar,
}

/// Stops a running control loop, also while it sleeps between ticks.
#[derive(Clone)]
pub struct ShutdownSwitch {
    shutdown: Arc<ShutdownState>,
}

assert_impl_all!(ShutdownSwitch: Send, Sync, Clone);

impl ShutdownSwitch {
    pub fn new() -> Self {
        Self {
            shutdown: Arc::new(ShutdownState {
                requested: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// Returns false if shutdown was already requested.
    pub fn request_shutdown(&self) -> bool {
        let mut requested = self.shutdown.requested.lock();
        if *requested {
            return false;
        }

        *requested = true;
        self.shutdown.wakeup.notify_all();
        true
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        *self.shutdown.requested.lock()
    }

    /// Sleeps for `timeout` unless shutdown is requested first. Returns
    /// whether shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.shutdown.requested.lock();
        while !*requested {
            if self
                .shutdown
                .wakeup
                .wait_until(&mut requested, deadline)
                .timed_out()
            {
                break;
            }
        }
        *requested
    }
}

impl Default for ShutdownSwitch {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Drives an [`AffinityController`] at a fixed cadence until shut down.
pub struct ControlLoop<S: Platform> {
    controller: AffinityController<S>,
    poll_interval: Duration,
    shutdown: ShutdownSwitch,
}

impl<S: Platform> ControlLoop<S> {
    pub fn new(controller: AffinityController<S>, poll_interval: Duration) -> Self {
        Self {
            controller,
            poll_interval,
            shutdown: ShutdownSwitch::new(),
        }
    }

    pub fn get_shutdown_switch(&self) -> ShutdownSwitch {
        self.shutdown.clone()
    }

    #[inline]
    pub fn controller(&self) -> &AffinityController<S> {
        &self.controller
    }

    /// Ticks until shutdown is requested, handing every outcome to `observe`.
    /// The managed process is released before returning.
    pub fn run<F: FnMut(&TickOutcome)>(mut self, mut observe: F) -> AffinityController<S> {
        log::info!(
            "control loop started, polling every {}ms",
            self.poll_interval.as_millis()
        );

        while !self.shutdown.is_requested() {
            let outcome = self.controller.tick();
            observe(&outcome);

            if self.shutdown.wait_timeout(self.poll_interval) {
                break;
            }
        }

        log::info!("shutdown was requested");
        if let Some(outcome) = self.controller.release() {
            observe(&outcome);
        }
        self.controller
    }

    /// Runs `ticks` control steps back to back, without sleeping.
    pub fn run_ticks<F: FnMut(&TickOutcome)>(&mut self, ticks: usize, mut observe: F) {
        for _ in 0..ticks {
            if self.shutdown.is_requested() {
                return;
            }
            let outcome = self.controller.tick();
            observe(&outcome);
        }
    }
}
