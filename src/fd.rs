//! File descriptor helpers.

use crate::error::Result;
use rustix::event::{EventfdFlags, eventfd};
use rustix::io::Errno;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

// ============================================================================
// EventFd Wrapper
// ============================================================================

/// Counter descriptor that becomes readable once notified.
///
/// Used by push-driven sources: producers on other threads call
/// [`notify`](EventFd::notify) and the chain's poll wakes up.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a new eventfd with initial value 0.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Signal the eventfd (increment counter).
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        rustix::io::write(&self.fd, &val.to_ne_bytes())?;
        Ok(())
    }

    /// Try to read from the eventfd (non-blocking).
    ///
    /// Returns the accumulated count, or 0 if nothing was signalled.
    pub fn try_wait(&self) -> Result<u64> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => Ok(u64::from_ne_bytes(buf)),
            Ok(_) => Ok(0),
            Err(Errno::WOULDBLOCK) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsFd for EventFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Duplicate a descriptor with close-on-exec set.
pub fn dup_cloexec(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    Ok(rustix::io::fcntl_dupfd_cloexec(fd, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::event::{PollFd, PollFlags, poll};
    use rustix::time::Timespec;

    #[test]
    fn test_eventfd_counts() {
        let efd = EventFd::new().unwrap();
        assert_eq!(efd.try_wait().unwrap(), 0);
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.try_wait().unwrap(), 2);
        assert_eq!(efd.try_wait().unwrap(), 0);
    }

    #[test]
    fn test_eventfd_pollable() {
        let efd = EventFd::new().unwrap();
        let zero = Timespec { tv_sec: 0, tv_nsec: 0 };

        let mut fds = [PollFd::new(&efd, PollFlags::IN)];
        poll(&mut fds, Some(&zero)).unwrap();
        assert!(!fds[0].revents().contains(PollFlags::IN));

        efd.notify().unwrap();
        let mut fds = [PollFd::new(&efd, PollFlags::IN)];
        poll(&mut fds, Some(&zero)).unwrap();
        assert!(fds[0].revents().contains(PollFlags::IN));
    }

    #[test]
    fn test_dup_cloexec_shares_counter() {
        let efd = EventFd::new().unwrap();
        let dup = dup_cloexec(efd.as_fd()).unwrap();
        efd.notify().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(rustix::io::read(&dup, &mut buf).unwrap(), 8);
        assert_eq!(u64::from_ne_bytes(buf), 1);
    }
}
