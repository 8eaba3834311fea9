use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Liveness checks against agent processes recorded on run rows.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    fn terminate(&self, pid: u32);
}

pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                debug!("Probing PID {} failed: {}", pid, e);
                false
            }
        }
    }

    fn terminate(&self, pid: u32) {
        let Ok(raw) = i32::try_from(pid) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            if e != Errno::ESRCH {
                warn!("Failed to terminate PID {}: {}", pid, e);
            }
        }
    }
}
