//! The dispatcher's wait primitive.
//!
//! A self-pipe plus `poll(2)`: the dispatcher thread parks here between
//! iterations, producer threads wake it, and registered receive fds report
//! consumer finished signals.  `poll` is invoked through `nix::libc`
//! directly so the timeout stays a plain millisecond count.

use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use anyhow::Context;

/// One fd readiness report from a poll round.
#[derive(Debug, Clone, Copy)]
pub struct FdEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub error: bool,
}

pub struct Looper {
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    watched: Mutex<Vec<RawFd>>,
}

impl Looper {
    pub fn new() -> anyhow::Result<Self> {
        let (wake_read, wake_write) =
            nix::unistd::pipe().context("failed to create looper wake pipe")?;
        for fd in [&wake_read, &wake_write] {
            nix::fcntl::fcntl(fd.as_raw_fd(), nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK))
                .context("failed to set O_NONBLOCK on wake pipe")?;
        }
        Ok(Self {
            wake_read,
            wake_write,
            watched: Mutex::new(Vec::new()),
        })
    }

    /// Interrupt a poll in progress (or make the next poll return at once).
    pub fn wake(&self) {
        // A full pipe already guarantees the next poll returns immediately.
        let _ = nix::unistd::write(&self.wake_write, b"w");
    }

    /// Watch a receive fd for readability and errors.
    pub fn add_fd(&self, fd: RawFd) {
        let mut watched = self.watched.lock().unwrap();
        if !watched.contains(&fd) {
            watched.push(fd);
        }
    }

    pub fn remove_fd(&self, fd: RawFd) {
        self.watched.lock().unwrap().retain(|&watched| watched != fd);
    }

    /// Block until a watched fd is ready, a wake arrives, or the timeout
    /// elapses.  `timeout_ms < 0` waits indefinitely.
    pub fn poll(&self, timeout_ms: i32) -> Vec<FdEvent> {
        let mut fds: Vec<nix::libc::pollfd> = Vec::new();
        fds.push(nix::libc::pollfd {
            fd: self.wake_read.as_raw_fd(),
            events: nix::libc::POLLIN,
            revents: 0,
        });
        {
            let watched = self.watched.lock().unwrap();
            for &fd in watched.iter() {
                fds.push(nix::libc::pollfd {
                    fd,
                    events: nix::libc::POLLIN,
                    revents: 0,
                });
            }
        }

        let res = unsafe {
            nix::libc::poll(fds.as_mut_ptr(), fds.len() as nix::libc::nfds_t, timeout_ms)
        };
        if res <= 0 {
            return Vec::new();
        }

        // Drain the wake pipe so the next poll can block again.
        if fds[0].revents & nix::libc::POLLIN != 0 {
            let mut buf = [0u8; 64];
            while matches!(nix::unistd::read(self.wake_read.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
        }

        const ERROR_BITS: nix::libc::c_short =
            nix::libc::POLLERR | nix::libc::POLLHUP | nix::libc::POLLNVAL;
        fds[1..]
            .iter()
            .filter(|pollfd| pollfd.revents != 0)
            .map(|pollfd| FdEvent {
                fd: pollfd.fd,
                readable: pollfd.revents & nix::libc::POLLIN != 0,
                error: pollfd.revents & ERROR_BITS != 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_poll_times_out() {
        let looper = Looper::new().unwrap();
        let start = Instant::now();
        let events = looper.poll(20);
        assert!(events.is_empty());
        assert!(start.elapsed().as_millis() >= 15);
    }

    #[test]
    fn test_wake_interrupts_poll() {
        let looper = Looper::new().unwrap();
        looper.wake();
        let start = Instant::now();
        let events = looper.poll(5000);
        assert!(events.is_empty());
        assert!(start.elapsed().as_millis() < 1000);
    }

    #[test]
    fn test_watched_fd_reports_readable() {
        let looper = Looper::new().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        looper.add_fd(read_end.as_raw_fd());

        nix::unistd::write(&write_end, b"x").unwrap();
        let events = looper.poll(1000);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, read_end.as_raw_fd());
        assert!(events[0].readable);
        assert!(!events[0].error);

        looper.remove_fd(read_end.as_raw_fd());
        nix::unistd::write(&write_end, b"x").unwrap();
        // Removed fds are no longer reported; only the timeout fires.
        assert!(looper.poll(20).is_empty());
    }
}
