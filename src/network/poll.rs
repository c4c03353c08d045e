//! Multiplexed readiness wait over the two relay descriptors.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Readiness of one descriptor after a wait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    /// Error, hang-up or invalid descriptor.
    pub failed: bool,
}

/// Waits until either descriptor is ready or the timeout elapses.
pub trait Poller {
    /// An interrupted wait reports nothing ready.
    fn wait(&mut self, fds: [RawFd; 2], timeout: Duration) -> io::Result<[Readiness; 2]>;
}

/// `poll(2)`-backed [`Poller`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SysPoller;

impl Poller for SysPoller {
    fn wait(&mut self, fds: [RawFd; 2], timeout: Duration) -> io::Result<[Readiness; 2]> {
        let mut pollfds = fds.map(|fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: `pollfds` is a valid array of the length passed.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok([Readiness::default(); 2]);
            }
            return Err(err);
        }

        Ok(pollfds.map(|pollfd| Readiness {
            readable: pollfd.revents & libc::POLLIN != 0,
            failed: pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0,
        }))
    }
}
