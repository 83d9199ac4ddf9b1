use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::process::Stdio;

use nix::libc;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::SpawnError;

use super::ShellCommand;

/// Master side of a pseudo-terminal.
///
/// Reads and writes go through a non-blocking fd registered with the tokio
/// reactor. `close` fails every pending and future operation; the fd itself
/// is released when the last owner drops the `Pty`.
pub struct Pty {
    fd: AsyncFd<OwnedFd>,
    closed: CancellationToken,
}

/// Allocate a pty pair and start `command` with the slave as its controlling
/// terminal and stdio. Returns the child and the master side.
pub fn spawn(command: &ShellCommand) -> Result<(Child, Pty), SpawnError> {
    let pair = nix::pty::openpty(None, None).map_err(io::Error::from)?;
    set_cloexec(pair.master.as_raw_fd())?;
    set_cloexec(pair.slave.as_raw_fd())?;
    set_nonblocking(pair.master.as_raw_fd())?;
    let pty = Pty {
        fd: AsyncFd::new(pair.master)?,
        closed: CancellationToken::new(),
    };

    let process_err = |source: io::Error| SpawnError::Process {
        program: command.program.clone(),
        source,
    };
    let slave = pair.slave;
    let stdin = slave.try_clone().map_err(process_err)?;
    let stdout = slave.try_clone().map_err(process_err)?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave));
    if !command.env.is_empty() {
        cmd.env_clear().envs(command.env.iter().cloned());
    }
    // New session with the slave (already on fd 0) as controlling terminal.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(process_err)?;
    // Drop our copies of the slave so the master sees EIO once the child is gone.
    drop(cmd);

    Ok((child, pty))
}

impl Pty {
    /// Read the next available chunk. EOF, EIO (slave side gone) and `close`
    /// all surface as errors.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(closed_error()),
                ready = self.fd.readable() => ready?,
            };

            match guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pty EOF"))
                }
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all of `data` to the terminal input.
    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = tokio::select! {
                _ = self.closed.cancelled() => return Err(closed_error()),
                ready = self.fd.writable() => ready?,
            };

            match guard.try_io(|inner| {
                let n =
                    unsafe { libc::write(inner.as_raw_fd(), data.as_ptr() as *const _, data.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the window size (TIOCSWINSZ).
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current window size as (cols, rows).
    pub fn size(&self) -> io::Result<(u16, u16)> {
        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok((ws.ws_col, ws.ws_row))
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pty closed")
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ShellCommand {
        ShellCommand::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    async fn read_to_end(pty: &Pty) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(n) = pty.read(&mut buf).await {
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_spawn_captures_output() {
        let (mut child, pty) = spawn(&sh("printf hello")).unwrap();
        let out = read_to_end(&pty).await;
        assert_eq!(out, b"hello");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_child_sees_a_terminal() {
        let (_child, pty) = spawn(&sh("test -t 0 && test -t 1 && printf tty")).unwrap();
        let out = read_to_end(&pty).await;
        assert_eq!(out, b"tty");
    }

    #[tokio::test]
    async fn test_write_reaches_child() {
        let (_child, pty) = spawn(&sh("stty -echo; read line; printf '<%s>' \"$line\"")).unwrap();
        pty.write_all(b"ping\n").await.unwrap();
        let out = read_to_end(&pty).await;
        assert!(String::from_utf8_lossy(&out).contains("<ping>"));
    }

    #[tokio::test]
    async fn test_resize_updates_window_size() {
        let (mut child, pty) = spawn(&sh("sleep 5")).unwrap();
        pty.resize(120, 40).unwrap();
        assert_eq!(pty.size().unwrap(), (120, 40));
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_read() {
        let (mut child, pty) = spawn(&sh("sleep 5")).unwrap();
        let pty = std::sync::Arc::new(pty);
        let reader = {
            let pty = pty.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                pty.read(&mut buf).await
            })
        };
        pty.close();
        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(pty.write_all(b"x").await.is_err());
        assert!(pty.resize(80, 24).is_err());
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cmd = ShellCommand::new("/nonexistent/termbridge-test", vec![]);
        match spawn(&cmd) {
            Err(SpawnError::Process { program, .. }) => {
                assert_eq!(program, "/nonexistent/termbridge-test")
            }
            other => panic!("expected process error, got {:?}", other.map(|_| ())),
        }
    }
}
