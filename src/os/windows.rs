//! Win32 backend.
//!
//! Thread states come from the `SystemProcessInformation` snapshot, the only
//! documented source reporting whether a thread is running right now.

use crate::os::{Pid, ProcessHandle, ProcessInfo, ThreadInfo, ThreadState, Tid, WindowHandle, WindowQuery};
use crate::util::cpu::AffinityMask;
use anyhow::{anyhow, bail};
use std::ffi::OsString;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStringExt;
use std::path::Path;
use std::time::Duration;
use windows_sys::Wdk::System::SystemInformation::{NtQuerySystemInformation, SystemProcessInformation};
use windows_sys::Win32::Foundation::{
    CloseHandle, FILETIME, HANDLE, STATUS_INFO_LENGTH_MISMATCH, STILL_ACTIVE,
};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, GetProcessTimes, OpenProcess, OpenThread, QueryFullProcessImageNameW,
    SetThreadAffinityMask, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
    THREAD_QUERY_INFORMATION, THREAD_SET_INFORMATION,
};
use windows_sys::Win32::System::WindowsProgramming::{
    SYSTEM_PROCESS_INFORMATION, SYSTEM_THREAD_INFORMATION,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{GetForegroundWindow, GetWindowThreadProcessId};

/// `KTHREAD_STATE::Running`
const THREAD_STATE_RUNNING: u32 = 2;

/// FILETIME ticks are 100ns.
const FILETIME_TICK_NANOS: u64 = 100;

const EMPTY_FILETIME: FILETIME = FILETIME {
    dwLowDateTime: 0,
    dwHighDateTime: 0,
};

#[derive(Copy, Clone, Debug, Default)]
pub struct Win32System;

impl Win32System {
    pub fn new() -> Self {
        Self
    }
}

impl WindowQuery for Win32System {
    fn foreground_window(&self) -> Option<WindowHandle> {
        let hwnd = unsafe { GetForegroundWindow() };
        if hwnd.is_null() {
            None
        } else {
            Some(WindowHandle(hwnd as usize))
        }
    }

    fn window_process_id(&self, window: WindowHandle) -> Pid {
        let mut pid = 0u32;
        unsafe {
            GetWindowThreadProcessId(window.0 as _, &mut pid);
        }
        Pid(pid)
    }
}

impl ProcessInfo for Win32System {
    type Handle = Win32Process;

    fn open_process(&self, pid: Pid) -> anyhow::Result<Self::Handle> {
        let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid.0) };
        if handle.is_null() {
            return Err(anyhow!(io::Error::last_os_error()).context(format!("opening process {}", pid)));
        }

        let process = Win32Process { pid, handle };
        if process.has_exited() {
            bail!("process {} has exited", pid);
        }
        Ok(process)
    }
}

pub struct Win32Process {
    pid: Pid,
    handle: HANDLE,
}

impl ProcessHandle for Win32Process {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn name(&self) -> String {
        let mut buffer = vec![0u16; 1024];
        let mut size = buffer.len() as u32;
        let ok = unsafe {
            QueryFullProcessImageNameW(self.handle, PROCESS_NAME_WIN32, buffer.as_mut_ptr(), &mut size)
        };
        if ok == 0 {
            return format!("<{}>", self.pid);
        }

        let path = OsString::from_wide(&buffer[..size as usize]);
        Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned())
    }

    fn has_exited(&self) -> bool {
        let mut code = 0u32;
        let ok = unsafe { GetExitCodeProcess(self.handle, &mut code) };
        ok == 0 || code != STILL_ACTIVE as u32
    }

    fn cpu_time(&self) -> anyhow::Result<Duration> {
        let mut creation = EMPTY_FILETIME;
        let mut exit = EMPTY_FILETIME;
        let mut kernel = EMPTY_FILETIME;
        let mut user = EMPTY_FILETIME;

        let ok = unsafe {
            GetProcessTimes(self.handle, &mut creation, &mut exit, &mut kernel, &mut user)
        };
        if ok == 0 {
            return Err(anyhow!(io::Error::last_os_error())
                .context(format!("reading times of process {}", self.pid)));
        }

        let ticks = filetime_ticks(kernel) + filetime_ticks(user);
        Ok(Duration::from_nanos(ticks * FILETIME_TICK_NANOS))
    }

    fn threads(&self) -> anyhow::Result<Vec<ThreadInfo>> {
        let snapshot = process_snapshot()?;
        let mut offset = 0usize;

        loop {
            // entries are 8 byte aligned inside the snapshot buffer
            let entry = unsafe {
                &*((snapshot.as_ptr() as *const u8).add(offset) as *const SYSTEM_PROCESS_INFORMATION)
            };

            if entry.UniqueProcessId as usize == self.pid.0 as usize {
                let first = unsafe {
                    (entry as *const SYSTEM_PROCESS_INFORMATION).add(1) as *const SYSTEM_THREAD_INFORMATION
                };
                let threads = (0..entry.NumberOfThreads as usize)
                    .map(|i| {
                        let thread = unsafe { &*first.add(i) };
                        let state = if thread.ThreadState == THREAD_STATE_RUNNING {
                            ThreadState::Running
                        } else {
                            ThreadState::NotRunning
                        };
                        ThreadInfo {
                            tid: Tid(thread.ClientId.UniqueThread as usize as u32),
                            state,
                        }
                    })
                    .collect();
                return Ok(threads);
            }

            if entry.NextEntryOffset == 0 {
                bail!("process {} has exited", self.pid);
            }
            offset += entry.NextEntryOffset as usize;
        }
    }

    fn set_thread_affinity(&self, tid: Tid, mask: AffinityMask) -> anyhow::Result<()> {
        let thread = unsafe { OpenThread(THREAD_SET_INFORMATION | THREAD_QUERY_INFORMATION, 0, tid.0) };
        if thread.is_null() {
            return Err(anyhow!(io::Error::last_os_error()).context(format!("opening thread {}", tid.0)));
        }

        let previous = unsafe { SetThreadAffinityMask(thread, mask.bits() as usize) };
        let result = if previous == 0 {
            Err(anyhow!(io::Error::last_os_error()).context(format!("setting affinity {}", mask)))
        } else {
            Ok(())
        };

        unsafe {
            CloseHandle(thread);
        }
        result
    }
}

impl Drop for Win32Process {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

fn filetime_ticks(time: FILETIME) -> u64 {
    u64::from(time.dwLowDateTime) | (u64::from(time.dwHighDateTime) << 32)
}

/// Process and thread snapshot of the whole system, grown until it fits.
fn process_snapshot() -> anyhow::Result<Vec<u64>> {
    let mut buffer: Vec<u64> = vec![0; 64 * 1024];

    loop {
        let mut needed = 0u32;
        let status = unsafe {
            NtQuerySystemInformation(
                SystemProcessInformation,
                buffer.as_mut_ptr() as *mut _,
                (buffer.len() * mem::size_of::<u64>()) as u32,
                &mut needed,
            )
        };

        if status == STATUS_INFO_LENGTH_MISMATCH {
            let words = needed as usize / mem::size_of::<u64>() + 1;
            buffer.resize(words.max(buffer.len() * 2), 0);
            continue;
        }
        if status < 0 {
            bail!("querying process snapshot failed with status {:#X}", status);
        }
        return Ok(buffer);
    }
}
