//! Interrupt line and the multiplexed wait.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, trace};

use crate::error::{SfpdError, SfpdResult};

/// One reason the wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The transceiver interrupt line fired.
    Interrupt,
    /// A caller-registered descriptor is ready.
    File { fd: RawFd, events: PollFlags },
}

/// Something the monitor can block on.
pub trait WakeSource {
    /// Blocks until at least one source is ready. An empty result means the
    /// wait was interrupted by a signal.
    fn wait(&mut self) -> SfpdResult<Vec<Wake>>;

    /// Re-enables the interrupt line for the next edge.
    fn rearm(&mut self) -> SfpdResult<()>;
}

/// Kernel file exposing the transceiver interrupt line.
///
/// Signals through `POLLPRI`; must be re-armed by writing a token after
/// every wake or later edges are lost.
#[derive(Debug)]
pub struct InterruptLine {
    file: File,
    path: PathBuf,
    token: Vec<u8>,
}

impl InterruptLine {
    pub fn open(path: impl AsRef<Path>, token: impl Into<Vec<u8>>) -> SfpdResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| SfpdError::Interrupt {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "Opened interrupt line");
        Ok(Self {
            file,
            path,
            token: token.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rearm(&self) -> SfpdResult<()> {
        let mut file = &self.file;
        file.write_all(&self.token)
            .and_then(|()| file.flush())
            .map_err(|source| self.error(source))?;
        trace!(path = %self.path.display(), "Re-armed interrupt line");
        Ok(())
    }

    fn error(&self, source: io::Error) -> SfpdError {
        SfpdError::Interrupt {
            path: self.path.clone(),
            source,
        }
    }
}

impl AsFd for InterruptLine {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// `poll(2)` over the interrupt line plus caller descriptors, no timeout.
#[derive(Debug)]
pub struct PollWaitSet<'a> {
    interrupt: &'a InterruptLine,
    extra: Vec<(BorrowedFd<'a>, PollFlags)>,
}

impl<'a> PollWaitSet<'a> {
    pub fn new(interrupt: &'a InterruptLine) -> Self {
        Self {
            interrupt,
            extra: Vec::new(),
        }
    }

    /// Adds a descriptor whose readiness is forwarded to the supervisor.
    pub fn register(&mut self, fd: BorrowedFd<'a>, events: PollFlags) {
        self.extra.push((fd, events));
    }
}

impl WakeSource for PollWaitSet<'_> {
    fn wait(&mut self) -> SfpdResult<Vec<Wake>> {
        let mut fds = Vec::with_capacity(self.extra.len() + 1);
        fds.push(PollFd::new(self.interrupt.as_fd(), PollFlags::POLLPRI));
        fds.extend(self.extra.iter().map(|(fd, events)| PollFd::new(*fd, *events)));

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(errno) => return Err(self.interrupt.error(io::Error::from(errno))),
        }

        let mut wakes = Vec::new();
        for (i, pfd) in fds.iter().enumerate() {
            let Some(events) = pfd.revents().filter(|e| !e.is_empty()) else {
                continue;
            };
            if i == 0 {
                wakes.push(Wake::Interrupt);
            } else {
                let fd = self.extra[i - 1].0.as_raw_fd();
                wakes.push(Wake::File { fd, events });
            }
        }
        Ok(wakes)
    }

    fn rearm(&mut self) -> SfpdResult<()> {
        self.interrupt.rearm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_rearm_writes_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GPIO15");
        fs::write(&path, "").unwrap();

        let line = InterruptLine::open(&path, "1\n").unwrap();
        line.rearm().unwrap();
        line.rearm().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1\n1\n");
    }

    #[test]
    fn test_open_missing_line() {
        let err = InterruptLine::open("/nonexistent/GPIO15", "1\n").unwrap_err();
        assert!(matches!(err, SfpdError::Interrupt { .. }));
        assert!(err.to_string().contains("/nonexistent/GPIO15"));
    }

    #[test]
    fn test_wait_reports_registered_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("GPIO15");
        fs::write(&path, "").unwrap();
        let line = InterruptLine::open(&path, "1\n").unwrap();

        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();

        let mut set = PollWaitSet::new(&line);
        set.register(rx.as_fd(), PollFlags::POLLIN);
        let wakes = set.wait().unwrap();

        // a regular file never raises POLLPRI
        assert_eq!(wakes.len(), 1);
        match wakes[0] {
            Wake::File { fd, events } => {
                assert_eq!(fd, rx.as_raw_fd());
                assert!(events.contains(PollFlags::POLLIN));
            }
            Wake::Interrupt => panic!("unexpected interrupt wake"),
        }
    }
}
