use std::collections::HashMap;
use std::io;
use std::mem;
use std::ptr;
use std::time::{Duration, Instant};

use crate::multiplexer::{no_buffer_space, timed_out, timeout_millis, Backend, BlockingAdjustment};
use crate::{Descriptor, Event, Events, Ready};

/// The `select(2)` back-end: three master bitmaps, one per requestable kind.
///
/// Each poll copies the masters into working sets, hands those to the
/// syscall, and walks the registered descriptors to see which bits survived.
/// Capacity is fixed at `FD_SETSIZE`; descriptors at or above it are refused
/// outright with `ENOBUFS` since `FD_SET` would scribble out of bounds.
pub struct SelectBackend {
    read_set: libc::fd_set,
    write_set: libc::fd_set,
    except_set: libc::fd_set,
    registered: HashMap<Descriptor, Ready>,
}

impl SelectBackend {
    /// An empty set of bitmaps.
    pub fn new() -> SelectBackend {
        SelectBackend {
            read_set: empty_set(),
            write_set: empty_set(),
            except_set: empty_set(),
            registered: HashMap::new(),
        }
    }

    fn set_bits(&mut self, descriptor: Descriptor, mask: Ready) {
        unsafe {
            if mask.is_readable() {
                libc::FD_SET(descriptor, &mut self.read_set);
            }
            if mask.is_writable() {
                libc::FD_SET(descriptor, &mut self.write_set);
            }
            if mask.is_except() {
                libc::FD_SET(descriptor, &mut self.except_set);
            }
        }
    }

    fn clear_bits(&mut self, descriptor: Descriptor) {
        unsafe {
            libc::FD_CLR(descriptor, &mut self.read_set);
            libc::FD_CLR(descriptor, &mut self.write_set);
            libc::FD_CLR(descriptor, &mut self.except_set);
        }
    }
}

impl Backend for SelectBackend {
    fn watching(&self, descriptor: Descriptor) -> Ready {
        self.registered
            .get(&descriptor)
            .copied()
            .unwrap_or(Ready::EMPTY)
    }

    fn watch(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        if descriptor < 0 || descriptor as usize >= libc::FD_SETSIZE {
            return Err(no_buffer_space());
        }
        if self.registered.contains_key(&descriptor) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        self.registered.insert(descriptor, mask);
        self.set_bits(descriptor, mask);
        Ok(BlockingAdjustment::Unchanged)
    }

    fn unwatch(&mut self, descriptor: Descriptor) -> io::Result<()> {
        if self.registered.remove(&descriptor).is_none() {
            return Err(io::ErrorKind::NotFound.into());
        }
        self.clear_bits(descriptor);
        Ok(())
    }

    fn unwatch_dead(&mut self, descriptor: Descriptor) {
        // Pure bookkeeping, there is no syscall to fail with EBADF here.
        if self.registered.remove(&descriptor).is_some() {
            self.clear_bits(descriptor);
        }
    }

    fn clear(&mut self) -> io::Result<()> {
        self.read_set = empty_set();
        self.write_set = empty_set();
        self.except_set = empty_set();
        self.registered.clear();
        Ok(())
    }

    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        // Validated up front so an oversized timeout is InvalidInput, not a
        // silently truncated wait.
        timeout_millis(timeout)?;

        events.clear();
        let deadline = timeout.map(|to| Instant::now() + to);

        let nfds = self
            .registered
            .keys()
            .max()
            .map(|fd| fd + 1)
            .unwrap_or(0);

        loop {
            // select(2) mutates its sets, so the masters stay pristine and
            // working copies go to the kernel.
            let mut read_set = self.read_set;
            let mut write_set = self.write_set;
            let mut except_set = self.except_set;

            let mut tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let tv_ptr = match deadline {
                None => ptr::null_mut(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tv.tv_sec = remaining.as_secs() as _;
                    tv.tv_usec = remaining.subsec_micros() as _;
                    &mut tv
                }
            };

            let res = syscall!(select(
                nfds,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                tv_ptr,
            ));

            match res {
                Ok(0) => return Err(timed_out()),
                Ok(_) => {
                    for (&fd, _) in self.registered.iter() {
                        let mut ready = Ready::EMPTY;
                        unsafe {
                            if libc::FD_ISSET(fd, &read_set) {
                                ready |= Ready::READABLE;
                            }
                            if libc::FD_ISSET(fd, &write_set) {
                                ready |= Ready::WRITABLE;
                            }
                            if libc::FD_ISSET(fd, &except_set) {
                                ready |= Ready::EXCEPT;
                            }
                        }
                        if !ready.is_empty() {
                            events.push(Event::new(fd, ready));
                        }
                    }
                    return Ok(());
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

fn empty_set() -> libc::fd_set {
    unsafe {
        let mut set = mem::MaybeUninit::<libc::fd_set>::zeroed().assume_init();
        libc::FD_ZERO(&mut set);
        set
    }
}

impl std::fmt::Debug for SelectBackend {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("SelectBackend")
            .field("registered", &self.registered)
            .finish()
    }
}
