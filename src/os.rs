//! Capabilities the controller needs from the operating system.
//!
//! The controller only talks to these traits. [`windows`] backs them with
//! Win32 calls, [`mock`] with an in-memory process table.

use crate::util::cpu::AffinityMask;
use std::fmt;
use std::time::{Duration, Instant};

pub mod mock;
#[cfg(windows)]
pub mod windows;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WindowHandle(pub usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Pid(pub u32);

impl Pid {
    /// Owner reported for some system surfaces, never a real process.
    pub const IDLE: Pid = Pid(0);

    #[inline]
    pub fn is_idle(self) -> bool {
        self == Self::IDLE
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tid(pub u32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Running,
    NotRunning,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub state: ThreadState,
}

impl ThreadInfo {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == ThreadState::Running
    }
}

pub trait WindowQuery {
    /// The active top level window, `None` while nothing has the focus.
    fn foreground_window(&self) -> Option<WindowHandle>;

    /// Owner of `window`, [`Pid::IDLE`] if the system can't name one.
    fn window_process_id(&self, window: WindowHandle) -> Pid;
}

pub trait ProcessInfo {
    type Handle: ProcessHandle;

    /// Fails if the process doesn't exist (anymore) or can't be accessed.
    fn open_process(&self, pid: Pid) -> anyhow::Result<Self::Handle>;

    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// An opened process. The process itself is owned by the system and may exit
/// at any time, every query can fail for that reason.
pub trait ProcessHandle {
    fn pid(&self) -> Pid;

    fn name(&self) -> String;

    fn has_exited(&self) -> bool;

    /// Processor time accumulated over all threads, user and kernel.
    fn cpu_time(&self) -> anyhow::Result<Duration>;

    fn threads(&self) -> anyhow::Result<Vec<ThreadInfo>>;

    fn set_thread_affinity(&self, tid: Tid, mask: AffinityMask) -> anyhow::Result<()>;
}

/// Everything a controller runs on.
pub trait Platform: WindowQuery + ProcessInfo {}

impl<T: WindowQuery + ProcessInfo> Platform for T {}
