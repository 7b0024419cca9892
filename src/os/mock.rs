//! In-memory platform with a scripted foreground window, a manual clock and a
//! log of every affinity write. Clones share the same state, so a test keeps
//! one clone to drive the scenario while the controller owns another.

use crate::os::{Pid, ProcessHandle, ProcessInfo, ThreadInfo, ThreadState, Tid, WindowHandle, WindowQuery};
use crate::util::cpu::AffinityMask;
use crate::util::{HashMap, IndexMap};
use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AffinityWrite {
    pub pid: Pid,
    pub tid: Tid,
    pub mask: AffinityMask,
}

struct MockThread {
    state: ThreadState,
    affinity: AffinityMask,
    gone: bool,
}

struct MockProcessState {
    name: String,
    cpu_time: Duration,
    exited: bool,
    deny_affinity: bool,
    threads: IndexMap<Tid, MockThread>,
}

struct MockState {
    epoch: Instant,
    elapsed: Duration,
    foreground: Option<(WindowHandle, Pid)>,
    next_window: usize,
    processes: HashMap<Pid, MockProcessState>,
    writes: Vec<AffinityWrite>,
}

impl MockState {
    fn process_mut(&mut self, pid: Pid) -> &mut MockProcessState {
        self.processes
            .get_mut(&pid)
            .unwrap_or_else(|| panic!("unknown mock process {}", pid))
    }

    fn live_process(&self, pid: Pid) -> anyhow::Result<&MockProcessState> {
        match self.processes.get(&pid) {
            Some(process) if !process.exited => Ok(process),
            Some(_) => Err(anyhow!("process {} has exited", pid)),
            None => Err(anyhow!("process {} does not exist", pid)),
        }
    }
}

#[derive(Clone)]
pub struct MockSystem {
    state: Arc<Mutex<MockState>>,
}

impl MockSystem {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                epoch: Instant::now(),
                elapsed: Duration::default(),
                foreground: None,
                next_window: 1,
                processes: HashMap::default(),
                writes: Vec::default(),
            })),
        }
    }

    /// Adds a process with `running` running and `waiting` not running
    /// threads. Thread ids are `pid * 100 + n`.
    pub fn spawn(&self, pid: u32, name: &str, running: usize, waiting: usize) -> Pid {
        let states = std::iter::repeat(ThreadState::Running)
            .take(running)
            .chain(std::iter::repeat(ThreadState::NotRunning).take(waiting));
        let threads = states
            .enumerate()
            .map(|(i, state)| {
                let thread = MockThread {
                    state,
                    affinity: AffinityMask::from_bits(u64::MAX),
                    gone: false,
                };
                (Tid(pid * 100 + i as u32), thread)
            })
            .collect();

        let pid = Pid(pid);
        let process = MockProcessState {
            name: name.to_owned(),
            cpu_time: Duration::default(),
            exited: false,
            deny_affinity: false,
            threads,
        };
        self.state.lock().processes.insert(pid, process);
        pid
    }

    /// Gives the focus to a new window owned by `pid`.
    pub fn focus(&self, pid: Pid) {
        let mut state = self.state.lock();
        let window = WindowHandle(state.next_window);
        state.next_window += 1;
        state.foreground = Some((window, pid));
    }

    /// Focuses a surface the system can't attribute to a process.
    pub fn focus_system_surface(&self) {
        self.focus(Pid::IDLE);
    }

    pub fn clear_focus(&self) {
        self.state.lock().foreground = None;
    }

    pub fn advance(&self, wall: Duration) {
        self.state.lock().elapsed += wall;
    }

    /// Charges `cpu` processor time to `pid`.
    pub fn consume(&self, pid: Pid, cpu: Duration) {
        self.state.lock().process_mut(pid).cpu_time += cpu;
    }

    pub fn exit(&self, pid: Pid) {
        self.state.lock().process_mut(pid).exited = true;
    }

    /// Makes every later affinity write to `pid` fail with access denied.
    pub fn deny_affinity(&self, pid: Pid) {
        self.state.lock().process_mut(pid).deny_affinity = true;
    }

    /// Keeps `tid` in the thread list but fails writes to it, like a thread
    /// exiting between the snapshot and the affinity change.
    pub fn vanish_thread(&self, pid: Pid, tid: Tid) {
        let mut state = self.state.lock();
        if let Some(thread) = state.process_mut(pid).threads.get_mut(&tid) {
            thread.gone = true;
        }
    }

    pub fn set_thread_state(&self, pid: Pid, tid: Tid, thread_state: ThreadState) {
        let mut state = self.state.lock();
        if let Some(thread) = state.process_mut(pid).threads.get_mut(&tid) {
            thread.state = thread_state;
        }
    }

    pub fn thread_affinity(&self, pid: Pid, tid: Tid) -> Option<AffinityMask> {
        let state = self.state.lock();
        state
            .processes
            .get(&pid)
            .and_then(|process| process.threads.get(&tid))
            .map(|thread| thread.affinity)
    }

    /// All successful affinity writes, oldest first.
    pub fn affinity_writes(&self) -> Vec<AffinityWrite> {
        self.state.lock().writes.clone()
    }

    pub fn writes_for(&self, pid: Pid) -> Vec<AffinityWrite> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|write| write.pid == pid)
            .copied()
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

impl Default for MockSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowQuery for MockSystem {
    fn foreground_window(&self) -> Option<WindowHandle> {
        self.state.lock().foreground.map(|(window, _)| window)
    }

    fn window_process_id(&self, window: WindowHandle) -> Pid {
        match self.state.lock().foreground {
            Some((focused, pid)) if focused == window => pid,
            _ => Pid::IDLE,
        }
    }
}

impl ProcessInfo for MockSystem {
    type Handle = MockProcess;

    fn open_process(&self, pid: Pid) -> anyhow::Result<Self::Handle> {
        self.state.lock().live_process(pid)?;
        Ok(MockProcess {
            pid,
            state: self.state.clone(),
        })
    }

    fn now(&self) -> Instant {
        let state = self.state.lock();
        state.epoch + state.elapsed
    }
}

pub struct MockProcess {
    pid: Pid,
    state: Arc<Mutex<MockState>>,
}

impl ProcessHandle for MockProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn name(&self) -> String {
        self.state
            .lock()
            .processes
            .get(&self.pid)
            .map(|process| process.name.clone())
            .unwrap_or_default()
    }

    fn has_exited(&self) -> bool {
        self.state.lock().live_process(self.pid).is_err()
    }

    fn cpu_time(&self) -> anyhow::Result<Duration> {
        Ok(self.state.lock().live_process(self.pid)?.cpu_time)
    }

    fn threads(&self) -> anyhow::Result<Vec<ThreadInfo>> {
        let state = self.state.lock();
        let threads = state
            .live_process(self.pid)?
            .threads
            .iter()
            .map(|(tid, thread)| ThreadInfo {
                tid: *tid,
                state: thread.state,
            })
            .collect();
        Ok(threads)
    }

    fn set_thread_affinity(&self, tid: Tid, mask: AffinityMask) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.live_process(self.pid)?.deny_affinity {
            bail!("access denied to process {}", self.pid);
        }

        let thread = state
            .process_mut(self.pid)
            .threads
            .get_mut(&tid)
            .filter(|thread| !thread.gone)
            .ok_or_else(|| anyhow!("thread {} of process {} has exited", tid.0, self.pid))?;
        thread.affinity = mask;

        state.writes.push(AffinityWrite {
            pid: self.pid,
            tid,
            mask,
        });
        Ok(())
    }
}
