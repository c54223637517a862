use anyhow::{bail, Result};
use common::ScatterError;
use smol_str::format_smolstr;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// What the caller wants to observe on a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// One slot of a readiness wait. `ready` is filled in by the wait.
#[derive(Clone, Copy, Debug)]
pub struct PollEvent {
    pub fd: RawFd,
    pub interest: Interest,
    pub ready: bool,
}

impl PollEvent {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            ready: false,
        }
    }
}

/// poll(2) over the given entries. EINTR counts as an empty wakeup so the
/// caller's tick logic still runs. An empty entry set sleeps the full
/// timeout, same as poll with nfds = 0.
pub fn wait_readiness(entries: &mut [PollEvent], timeout: Duration) -> Result<usize> {
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

    let mut pfds: Vec<libc::pollfd> = entries
        .iter()
        .map(|e| libc::pollfd {
            fd: e.fd,
            events: match e.interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            },
            revents: 0,
        })
        .collect();

    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(0);
        }
        bail!(ScatterError::Connection(format_smolstr!(
            "poll() failed: {err}"
        )));
    }
    if rc == 0 {
        return Ok(0);
    }

    let mut ready = 0;
    for (entry, pfd) in entries.iter_mut().zip(&pfds) {
        entry.ready = pfd.revents != 0;
        if entry.ready {
            ready += 1;
        }
    }
    Ok(ready)
}
