use crate::os::Platform;

/// Opens the process owning the active window.
///
/// Nothing is cached, the foreground changes at any time. `None` if no window
/// has the focus, the window belongs to no process or the process is gone.
pub fn current_foreground<S: Platform>(system: &S) -> Option<S::Handle> {
    let window = system.foreground_window()?;

    let pid = system.window_process_id(window);
    if pid.is_idle() {
        return None;
    }

    match system.open_process(pid) {
        Ok(process) => Some(process),
        Err(e) => {
            log::debug!("foreground process {} unavailable: {:#}", pid, e);
            None
        }
    }
}
