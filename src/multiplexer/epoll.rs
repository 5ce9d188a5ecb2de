use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::multiplexer::{timed_out, timeout_millis, Backend, BlockingAdjustment};
use crate::{Descriptor, Event, Events, Ready};

/// Events handed back by one `epoll_wait` call. The kernel simply fills the
/// next batch on the following pump.
const MAX_BATCH: usize = 1024;

/// The Linux `epoll(7)` back-end.
///
/// Registration maps 1:1 onto `epoll_ctl`, level-triggered, so the reactor's
/// re-masking discipline behaves exactly as it does on the portable
/// back-ends. The kernel offers no way to read a registration back out, so
/// [`watching`] always reports the empty mask.
///
/// [`watching`]: Backend::watching
#[derive(Debug)]
pub struct EpollBackend {
    ep: OwnedFd,
    batch: Vec<libc::epoll_event>,
}

impl EpollBackend {
    /// A fresh kernel queue.
    pub fn new() -> io::Result<EpollBackend> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollBackend {
            ep,
            batch: Vec::with_capacity(MAX_BATCH),
        })
    }

    fn ctl(&self, op: libc::c_int, descriptor: Descriptor, mask: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask_to_epoll(mask),
            u64: descriptor as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, descriptor, &mut event)).map(|_| ())
    }
}

impl Backend for EpollBackend {
    fn watching(&self, _descriptor: Descriptor) -> Ready {
        // The kernel set cannot be introspected.
        Ready::EMPTY
    }

    fn watch(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        self.ctl(libc::EPOLL_CTL_ADD, descriptor, mask)?;
        Ok(BlockingAdjustment::Unchanged)
    }

    fn modify(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        self.ctl(libc::EPOLL_CTL_MOD, descriptor, mask)?;
        Ok(BlockingAdjustment::Unchanged)
    }

    fn unwatch(&mut self, descriptor: Descriptor) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            descriptor,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    fn unwatch_dead(&mut self, _descriptor: Descriptor) {
        // The kernel drops the registration itself when the last reference
        // to the descriptor closes; EPOLL_CTL_DEL would only earn an EBADF.
    }

    fn clear(&mut self) -> io::Result<()> {
        // No way to enumerate the kernel set; a fresh instance is the only
        // way to empty it.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        self.ep = ep;
        Ok(())
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let millis = timeout_millis(timeout)?;

        events.clear();
        self.batch.clear();

        loop {
            let res = syscall!(epoll_wait(
                self.ep.as_raw_fd(),
                self.batch.as_mut_ptr(),
                MAX_BATCH as libc::c_int,
                millis,
            ));
            match res {
                Ok(0) => return Err(timed_out()),
                Ok(n) => {
                    // SAFETY: `epoll_wait` guarantees `n` events are written.
                    unsafe { self.batch.set_len(n as usize) };
                    break;
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }

        for entry in self.batch.iter() {
            events.push(Event::new(
                entry.u64 as RawFd,
                epoll_to_mask(entry.events),
            ));
        }

        Ok(())
    }
}

fn mask_to_epoll(mask: Ready) -> u32 {
    let mut kind = 0;
    if mask.is_readable() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if mask.is_writable() {
        kind |= EPOLLOUT;
    }
    if mask.is_except() {
        kind |= EPOLLPRI;
    }
    kind as u32
}

fn epoll_to_mask(epoll: u32) -> Ready {
    let epoll = epoll as libc::c_int;
    let mut mask = Ready::EMPTY;
    if epoll & EPOLLIN != 0 {
        mask |= Ready::READABLE;
    }
    if epoll & EPOLLOUT != 0 {
        mask |= Ready::WRITABLE;
    }
    if epoll & EPOLLPRI != 0 {
        mask |= Ready::EXCEPT;
    }
    if epoll & EPOLLERR != 0 {
        mask |= Ready::ERROR;
    }
    if epoll & (EPOLLHUP | EPOLLRDHUP) != 0 {
        mask |= Ready::HANGUP;
    }
    mask
}
