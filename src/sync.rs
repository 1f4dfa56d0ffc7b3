//! Explicit synchronization fences.
//!
//! Acquire, release and kms out-fences are sync-file descriptors. They are
//! modelled as linear resources: a [`SyncFence`] owns its fd and closes it on
//! drop, a broadcast to several consumers goes through [`SyncFence::duplicate`].
//! Nothing in this crate ever closes a fence twice or leaks one past the
//! owning frame.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use rustix::event::{PollFd, PollFlags};

/// An owned sync-file fence.
#[derive(Debug)]
pub struct SyncFence {
    fd: OwnedFd,
}

impl SyncFence {
    /// Wrap an already signalable sync-file fd.
    pub fn from_fd(fd: OwnedFd) -> Self {
        SyncFence { fd }
    }

    /// Duplicate the fence for handing out to an additional consumer.
    ///
    /// The duplicate is independently owned; closing one side does not
    /// invalidate the other.
    pub fn duplicate(&self) -> io::Result<SyncFence> {
        Ok(SyncFence {
            fd: self.fd.try_clone()?,
        })
    }

    /// Block until the fence signals.
    pub fn wait(&self) -> io::Result<()> {
        self.wait_timeout(-1).map(|_| ())
    }

    /// Block until the fence signals or `timeout_ms` elapses.
    ///
    /// Returns `true` if the fence signalled, `false` on timeout. A negative
    /// timeout waits forever.
    pub fn wait_timeout(&self, timeout_ms: i32) -> io::Result<bool> {
        loop {
            let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
            match rustix::event::poll(&mut fds, timeout_ms) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Consume the fence, handing ownership of the fd to the caller.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SyncFence {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SyncFence {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<OwnedFd> for SyncFence {
    fn from(fd: OwnedFd) -> Self {
        SyncFence::from_fd(fd)
    }
}

#[cfg(test)]
pub(crate) fn signalled_fence() -> SyncFence {
    use rustix::event::{eventfd, EventfdFlags};

    // An eventfd with a non-zero counter polls readable, which is all a
    // signalled sync-file looks like to the pipeline.
    let fd = eventfd(1, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).expect("eventfd");
    SyncFence::from_fd(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::event::{eventfd, EventfdFlags};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn signalled_fence_wait_returns() {
        let fence = signalled_fence();
        assert!(fence.wait_timeout(0).unwrap());
        fence.wait().unwrap();
    }

    #[test]
    fn unsignalled_fence_times_out() {
        let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap();
        let fence = SyncFence::from_fd(fd);
        assert!(!fence.wait_timeout(0).unwrap());
    }

    #[test]
    fn duplicate_is_independent() {
        let fence = signalled_fence();
        let dup = fence.duplicate().unwrap();
        assert_ne!(fence.as_raw_fd(), dup.as_raw_fd());
        drop(fence);
        assert!(dup.wait_timeout(0).unwrap());
    }
}
