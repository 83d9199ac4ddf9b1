use nix::sys::signal::kill;
use nix::unistd::Pid;

use super::{Session, SessionState};

/// Whether a session's backing process can be reused.
///
/// Sends signal 0 to the tracked pid. Any failure, EPERM included, counts as
/// dead: the pid may since have been recycled by an unrelated process.
pub fn is_alive(session: &Session) -> bool {
    if session.state() == SessionState::Exited {
        return false;
    }
    let alive = pid_alive(session.pid());
    if !alive {
        tracing::debug!(
            session = %session.id(),
            seq = session.seq(),
            pid = session.pid(),
            "Liveness probe failed"
        );
    }
    alive
}

/// Check if a process is still alive via kill(pid, 0)
pub fn pid_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), None).is_ok(),
        _ => false,
    }
}
