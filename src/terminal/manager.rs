use std::collections::HashMap;
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::RwLock;

use crate::error::SpawnError;

use super::liveness::is_alive;
use super::session::{pump_output, Session, SessionInfo, SessionState};
use super::{pty, CommandSource, Target};

/// Registry of live sessions, at most one per target.
pub struct SessionManager {
    inner: RwLock<Sessions>,
    commands: Box<dyn CommandSource>,
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<String, Arc<Session>>,
    /// Last sequence number handed out
    last_seq: u64,
}

impl SessionManager {
    pub fn new(commands: impl CommandSource + 'static) -> Self {
        Self {
            inner: RwLock::new(Sessions::default()),
            commands: Box::new(commands),
        }
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    /// Look up the live session for `target`, without creating one.
    pub async fn get(&self, target: &Target) -> Option<Arc<Session>> {
        let sessions = self.inner.read().await;
        sessions
            .by_id
            .get(&target.key())
            .filter(|s| is_alive(s))
            .cloned()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.read().await.by_id.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|i| i.seq);
        infos
    }

    /// Return the live session for `target`, spawning its process if there
    /// is none or the tracked one is dead.
    pub async fn get_or_create(self: &Arc<Self>, target: &Target) -> Result<Arc<Session>, SpawnError> {
        let id = target.key();

        // Fast path: reconnects and repeated polling
        {
            let sessions = self.inner.read().await;
            match sessions.by_id.get(&id) {
                Some(session) if is_alive(session) => {
                    tracing::debug!(session = %id, seq = session.seq(), "Reusing live session");
                    return Ok(session.clone());
                }
                Some(session) => {
                    tracing::info!(session = %id, seq = session.seq(), "Tracked session is dead, replacing");
                }
                None => tracing::debug!(session = %id, "No session, creating"),
            }
        }

        let mut sessions = self.inner.write().await;

        // Another caller may have created or replaced the entry between the
        // two locks.
        if let Some(session) = sessions.by_id.get(&id) {
            if is_alive(session) {
                tracing::debug!(session = %id, seq = session.seq(), "Double-check found live session");
                return Ok(session.clone());
            }
        }

        let command = self.commands.command_for(target);
        let (child, pty) = pty::spawn(&command).map_err(|e| {
            tracing::error!(session = %id, command = %command, error = %e, "Failed to spawn session");
            e
        })?;
        let pid = child.id().unwrap_or(0);

        sessions.last_seq += 1;
        let session = Arc::new(Session::new(id.clone(), sessions.last_seq, pid, pty));
        sessions.by_id.insert(id.clone(), session.clone());

        tracing::info!(session = %id, seq = session.seq(), pid = pid, command = %command, "Created session");

        tokio::spawn(pump_output(session.clone()));
        self.spawn_exit_watcher(session.clone(), child);
        session.set_state(SessionState::Running);

        Ok(session)
    }

    /// Wait for the session's process to exit, then close its pty and remove
    /// it from the registry unless a newer session already took its place.
    fn spawn_exit_watcher(self: &Arc<Self>, session: Arc<Session>, mut child: Child) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    tracing::info!(session = %session.id(), seq = session.seq(), status = %status, "Process exited")
                }
                Err(e) => {
                    tracing::warn!(session = %session.id(), seq = session.seq(), error = %e, "Waiting for process failed")
                }
            }
            session.close_pty();

            let mut sessions = manager.inner.write().await;
            let current = sessions
                .by_id
                .get(session.id())
                .is_some_and(|s| Arc::ptr_eq(s, &session));
            if current {
                sessions.by_id.remove(session.id());
                tracing::info!(session = %session.id(), seq = session.seq(), "Removed from registry");
            } else {
                tracing::debug!(session = %session.id(), seq = session.seq(), "Already replaced, not removing");
            }
            drop(sessions);

            session.set_state(SessionState::Exited);
        });
    }
}
