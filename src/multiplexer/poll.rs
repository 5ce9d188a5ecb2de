use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use crate::multiplexer::{timed_out, timeout_millis, Backend, BlockingAdjustment};
use crate::{Descriptor, Event, Events, Ready};

#[cfg(unix)]
use libc::{nfds_t, pollfd};
#[cfg(windows)]
use windows_sys::Win32::Networking::WinSock::{WSAPoll, WSAPOLLFD};

#[cfg(unix)]
const POLLIN: i16 = libc::POLLIN;
#[cfg(unix)]
const POLLPRI: i16 = libc::POLLPRI;
#[cfg(unix)]
const POLLOUT: i16 = libc::POLLOUT;
#[cfg(unix)]
const POLLERR: i16 = libc::POLLERR;
#[cfg(unix)]
const POLLHUP: i16 = libc::POLLHUP;
#[cfg(unix)]
const POLLNVAL: i16 = libc::POLLNVAL;

#[cfg(windows)]
const POLLIN: i16 = windows_sys::Win32::Networking::WinSock::POLLIN as i16;
#[cfg(windows)]
const POLLPRI: i16 = windows_sys::Win32::Networking::WinSock::POLLPRI as i16;
#[cfg(windows)]
const POLLOUT: i16 = windows_sys::Win32::Networking::WinSock::POLLOUT as i16;
#[cfg(windows)]
const POLLERR: i16 = windows_sys::Win32::Networking::WinSock::POLLERR as i16;
#[cfg(windows)]
const POLLHUP: i16 = windows_sys::Win32::Networking::WinSock::POLLHUP as i16;
#[cfg(windows)]
const POLLNVAL: i16 = windows_sys::Win32::Networking::WinSock::POLLNVAL as i16;

#[cfg(unix)]
type SysPollFd = pollfd;
#[cfg(windows)]
type SysPollFd = WSAPOLLFD;

/// The `poll(2)` back-end: one `pollfd` entry per watched descriptor.
///
/// Registration pushes onto the array; unwatching swap-removes, since entry
/// order carries no meaning. A side map from descriptor to array index keeps
/// both operations O(1).
pub struct PollBackend {
    fds: Vec<SysPollFd>,
    index: HashMap<Descriptor, usize>,
}

impl PollBackend {
    /// An empty descriptor array.
    pub fn new() -> PollBackend {
        PollBackend {
            fds: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl Backend for PollBackend {
    fn watching(&self, descriptor: Descriptor) -> Ready {
        match self.index.get(&descriptor) {
            Some(&idx) => requested_to_mask(self.fds[idx].events),
            None => Ready::EMPTY,
        }
    }

    fn watch(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        if self.index.contains_key(&descriptor) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        self.index.insert(descriptor, self.fds.len());
        self.fds.push(SysPollFd {
            fd: descriptor as _,
            events: mask_to_requested(mask),
            revents: 0,
        });
        Ok(BlockingAdjustment::Unchanged)
    }

    fn unwatch(&mut self, descriptor: Descriptor) -> io::Result<()> {
        let idx = self
            .index
            .remove(&descriptor)
            .ok_or(io::Error::from(io::ErrorKind::NotFound))?;
        self.fds.swap_remove(idx);
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd as Descriptor, idx);
        }
        Ok(())
    }

    fn unwatch_dead(&mut self, descriptor: Descriptor) {
        // Array bookkeeping only, nothing here can fail on a closed
        // descriptor.
        let _ = self.unwatch(descriptor);
    }

    fn clear(&mut self) -> io::Result<()> {
        self.fds.clear();
        self.index.clear();
        Ok(())
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        timeout_millis(timeout)?;

        events.clear();
        let deadline = timeout.map(|to| Instant::now() + to);

        loop {
            let millis = match deadline {
                None => -1,
                Some(deadline) => {
                    timeout_millis(Some(deadline.saturating_duration_since(Instant::now())))?
                }
            };

            #[cfg(unix)]
            let res = syscall!(poll(self.fds.as_mut_ptr(), self.fds.len() as nfds_t, millis));
            #[cfg(windows)]
            let res = wsa_syscall!(WSAPoll(self.fds.as_mut_ptr(), self.fds.len() as u32, millis));

            match res {
                Ok(0) => return Err(timed_out()),
                Ok(_) => break,
                #[cfg(unix)]
                Err(ref err)
                    if err.raw_os_error() == Some(libc::EINTR)
                        || err.raw_os_error() == Some(libc::EAGAIN) =>
                {
                    continue
                }
                Err(err) => return Err(err),
            }
        }

        for entry in self.fds.iter_mut() {
            if entry.revents != 0 {
                events.push(Event::new(
                    entry.fd as Descriptor,
                    revents_to_mask(entry.revents),
                ));
                entry.revents = 0;
            }
        }

        Ok(())
    }
}

fn mask_to_requested(mask: Ready) -> i16 {
    let mut kind = 0;
    if mask.is_readable() {
        kind |= POLLIN;
    }
    if mask.is_writable() {
        kind |= POLLOUT;
    }
    // WSAPoll rejects any request containing POLLPRI with WSAEINVAL, so the
    // bit is dropped on Windows. POLLHUP/POLLNVAL are still delivered.
    #[cfg(unix)]
    if mask.is_except() {
        kind |= POLLPRI;
    }
    kind
}

fn requested_to_mask(requested: i16) -> Ready {
    let mut mask = Ready::EMPTY;
    if requested & POLLIN != 0 {
        mask |= Ready::READABLE;
    }
    if requested & POLLOUT != 0 {
        mask |= Ready::WRITABLE;
    }
    if requested & POLLPRI != 0 {
        mask |= Ready::EXCEPT;
    }
    mask
}

fn revents_to_mask(revents: i16) -> Ready {
    let mut mask = Ready::EMPTY;
    if revents & POLLIN != 0 {
        mask |= Ready::READABLE;
    }
    if revents & POLLOUT != 0 {
        mask |= Ready::WRITABLE;
    }
    if revents & POLLPRI != 0 {
        mask |= Ready::EXCEPT;
    }
    if revents & POLLERR != 0 {
        mask |= Ready::ERROR;
    }
    if revents & POLLHUP != 0 {
        mask |= Ready::HANGUP;
    }
    if revents & POLLNVAL != 0 {
        mask |= Ready::INVALID;
    }
    mask
}

impl std::fmt::Debug for PollBackend {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("PollBackend")
            .field("len", &self.fds.len())
            .finish()
    }
}
