use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::pty::Pty;
use super::transport::{Outbound, OutboundSink};

/// PTY pump read buffer size
const PUMP_BUFFER: usize = 4096;

/// Longest a single write to a transport may take before the transport is
/// dropped. Writes happen under the link lock.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
}

/// Snapshot of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub seq: u64,
    pub pid: u32,
    pub state: SessionState,
    pub transport_seq: u64,
    pub attached: bool,
    /// Window size as (cols, rows), if the pty is still open
    pub size: Option<(u16, u16)>,
}

/// One live backing process bound to one target.
///
/// Owns the process's pty for its whole lifetime and holds at most one
/// attached transport sink. The sink is only touched under `link`.
pub struct Session {
    id: String,
    seq: u64,
    pid: u32,
    pty: Pty,
    link: Mutex<Link>,
    state: watch::Sender<SessionState>,
    send_timeout: Duration,
}

#[derive(Default)]
struct Link {
    current: Option<Attached>,
    /// Incremented on every attach
    transport_seq: u64,
}

struct Attached {
    attachment: Arc<Attachment>,
    sink: OutboundSink,
}

/// Identity of one attached transport. Compared by pointer, never by `seq`.
#[derive(Debug)]
pub struct Attachment {
    seq: u64,
    superseded: CancellationToken,
}

impl Attachment {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Resolves once a newer transport has taken over the session.
    pub async fn superseded(&self) {
        self.superseded.cancelled().await
    }
}

impl Session {
    pub(crate) fn new(id: String, seq: u64, pid: u32, pty: Pty) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            id,
            seq,
            pid,
            pty,
            link: Mutex::new(Link::default()),
            state,
            send_timeout: SEND_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current window size as (cols, rows). Fails once the pty is closed.
    pub fn size(&self) -> io::Result<(u16, u16)> {
        if self.pty.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty closed"));
        }
        self.pty.size()
    }

    /// Stop the pump and fail further pty reads and writes.
    pub(crate) fn close_pty(&self) {
        self.pty.close();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    /// Wait until the backing process has exited and the session is retired.
    #[cfg(test)]
    pub async fn exited(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Exited).await;
    }

    /// Make `sink` the current transport. A previously attached transport is
    /// marked superseded while the lock is held, so it never sees output
    /// produced after this call, and then closed.
    pub async fn attach(&self, sink: OutboundSink) -> Arc<Attachment> {
        let (previous, attachment) = {
            let mut link = self.link.lock().await;
            link.transport_seq += 1;
            let attachment = Arc::new(Attachment {
                seq: link.transport_seq,
                superseded: CancellationToken::new(),
            });
            let previous = link.current.replace(Attached {
                attachment: attachment.clone(),
                sink,
            });
            if let Some(previous) = &previous {
                previous.attachment.superseded.cancel();
            }
            (previous, attachment)
        };

        match previous {
            Some(mut previous) => {
                tracing::info!(
                    session = %self.id,
                    seq = self.seq,
                    from = previous.attachment.seq,
                    to = attachment.seq,
                    "Swapped transport, closing previous"
                );
                match tokio::time::timeout(self.send_timeout, previous.sink.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(session = %self.id, error = %e, "Closing previous transport failed")
                    }
                    Err(_) => {
                        tracing::debug!(session = %self.id, "Closing previous transport timed out")
                    }
                }
            }
            None => {
                tracing::info!(
                    session = %self.id,
                    seq = self.seq,
                    conn = attachment.seq,
                    "Attached transport"
                );
            }
        }

        attachment
    }

    /// Clear the current transport if it is still `attachment`.
    /// Returns whether it was the active one.
    pub async fn detach(&self, attachment: &Arc<Attachment>) -> bool {
        let mut link = self.link.lock().await;
        let active = link
            .current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(&c.attachment, attachment));
        if active {
            link.current = None;
        }
        active
    }

    /// Forward client keystrokes to the terminal.
    pub async fn write_input(&self, data: &[u8]) -> io::Result<()> {
        self.pty.write_all(data).await
    }

    /// Apply a window-size change. Serialized with attach/detach.
    pub async fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let _link = self.link.lock().await;
        self.pty.resize(cols, rows)
    }

    pub async fn info(&self) -> SessionInfo {
        let link = self.link.lock().await;
        SessionInfo {
            id: self.id.clone(),
            seq: self.seq,
            pid: self.pid,
            state: self.state(),
            transport_seq: link.transport_seq,
            attached: link.current.is_some(),
            size: self.size().ok(),
        }
    }

    /// Hand one chunk of output to the current transport, if any. A failed
    /// write drops the transport but leaves the pty and process alone. A write
    /// that does not finish within the send timeout also ends that
    /// connection's handoff loop.
    async fn deliver(&self, chunk: Bytes) {
        let mut link = self.link.lock().await;
        let Some(current) = link.current.as_mut() else {
            return;
        };
        let sent = tokio::time::timeout(
            self.send_timeout,
            current.sink.send(Outbound::Output(chunk)),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    session = %self.id,
                    seq = self.seq,
                    conn = current.attachment.seq,
                    error = %e,
                    "Write to transport failed, detaching"
                );
                link.current = None;
            }
            Err(_) => {
                tracing::warn!(
                    session = %self.id,
                    seq = self.seq,
                    conn = current.attachment.seq,
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Transport stalled, detaching"
                );
                if let Some(stalled) = link.current.take() {
                    stalled.attachment.superseded.cancel();
                }
            }
        }
    }
}

/// Persistent pty reader. One per session; runs until the pty read fails
/// (process gone or pty closed), delivering each chunk to whichever
/// transport is current at that moment.
pub(crate) async fn pump_output(session: Arc<Session>) {
    tracing::debug!(session = %session.id, seq = session.seq, "PTY pump started");
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        match session.pty.read(&mut buf).await {
            Ok(n) => session.deliver(Bytes::copy_from_slice(&buf[..n])).await,
            Err(e) => {
                tracing::debug!(session = %session.id, seq = session.seq, error = %e, "PTY pump exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::pty;
    use crate::terminal::transport::testing;
    use crate::terminal::ShellCommand;

    fn session(script: &str) -> (tokio::process::Child, Arc<Session>) {
        let cmd = ShellCommand::new("/bin/sh", vec!["-c".into(), script.into()]);
        let (child, pty) = pty::spawn(&cmd).unwrap();
        let pid = child.id().unwrap();
        (child, Arc::new(Session::new("test".into(), 1, pid, pty)))
    }

    #[tokio::test]
    async fn test_attach_supersedes_previous() {
        let (mut child, session) = session("sleep 5");

        let (first, mut first_peer) = testing::pair();
        let a = session.attach(first.sink).await;
        assert_eq!(a.seq(), 1);

        let (second, _second_peer) = testing::pair();
        let b = session.attach(second.sink).await;
        assert_eq!(b.seq(), 2);

        tokio::time::timeout(Duration::from_secs(1), a.superseded())
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), b.superseded())
                .await
                .is_err()
        );
        first_peer.closed().await;

        // Stale detach is a no-op
        assert!(!session.detach(&a).await);
        assert!(session.info().await.attached);
        assert!(session.detach(&b).await);
        assert!(!session.info().await.attached);

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_delivers_to_current_transport() {
        let (mut child, session) =
            session("stty -echo; while read l; do printf '[%s]' \"$l\"; done");
        let (transport, mut peer) = testing::pair();
        session.attach(transport.sink).await;
        tokio::spawn(pump_output(session.clone()));

        session.write_input(b"one\n").await.unwrap();
        session.write_input(b"two\n").await.unwrap();
        let out = peer.read_until("[two]").await.unwrap();
        let one = out.find("[one]").unwrap();
        let two = out.find("[two]").unwrap();
        assert!(one < two);

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_failure_detaches_without_stopping_pump() {
        let (mut child, session) =
            session("stty -echo; while read l; do printf '[%s]' \"$l\"; done");
        let pump = tokio::spawn(pump_output(session.clone()));

        let (transport, peer) = testing::pair();
        session.attach(transport.sink).await;
        drop(peer);

        session.write_input(b"lost\n").await.unwrap();
        while session.info().await.attached {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!pump.is_finished());
        assert_eq!(session.info().await.transport_seq, 1);

        let (transport, mut peer) = testing::pair();
        session.attach(transport.sink).await;
        session.write_input(b"found\n").await.unwrap();
        assert!(peer.read_until("[found]").await.is_some());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_resize_through_session() {
        let (mut child, session) = session("sleep 5");
        session.resize(100, 30).await.unwrap();
        assert_eq!(session.size().unwrap(), (100, 30));
        assert_eq!(session.info().await.size, Some((100, 30)));
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_transport_does_not_block_takeover() {
        let cmd = ShellCommand::new(
            "/bin/sh",
            vec!["-c".into(), "while true; do echo tick; sleep 0.05; done".into()],
        );
        let (mut child, pty) = pty::spawn(&cmd).unwrap();
        let pid = child.id().unwrap();
        let session = Arc::new(
            Session::new("test".into(), 1, pid, pty).with_send_timeout(Duration::from_millis(100)),
        );

        let stuck = session.attach(testing::stalled().sink).await;
        tokio::spawn(pump_output(session.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;

        // The stalled connection is told to stop
        tokio::time::timeout(Duration::from_secs(1), stuck.superseded())
            .await
            .unwrap();

        let (fresh, mut peer) = testing::pair();
        tokio::time::timeout(Duration::from_secs(3), session.attach(fresh.sink))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(3), session.resize(90, 20))
            .await
            .unwrap()
            .unwrap();
        assert!(peer.read_until("tick").await.is_some());
        assert!(!session.detach(&stuck).await);

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_size_fails_after_close() {
        let (mut child, session) = session("sleep 5");
        assert!(session.size().is_ok());
        session.close_pty();
        assert!(session.size().is_err());
        assert!(session.info().await.size.is_none());
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_resolves_on_state_change() {
        let (mut child, session) = session("true");
        assert_eq!(session.state(), SessionState::Starting);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.exited().await })
        };
        session.set_state(SessionState::Running);
        assert!(!waiter.is_finished());
        session.set_state(SessionState::Exited);
        waiter.await.unwrap();
        child.wait().await.unwrap();
    }
}
