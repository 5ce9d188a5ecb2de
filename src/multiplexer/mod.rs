//! Readiness multiplexing over interchangeable back-ends.
//!
//! A [`Multiplexer`] maintains a set of watched descriptors and reports which
//! of them are ready, without performing any I/O itself. The mechanism doing
//! the watching is a [`BackendKind`] chosen at construction: the portable
//! `select`-style bitmap and `poll`-style array back-ends, the Linux `epoll`
//! back-end, or the Windows message-driven back-end (which cannot be polled
//! and instead feeds the reactor through window messages).

use std::io;
use std::time::Duration;

use crate::{Descriptor, Events, Ready};

#[cfg(unix)]
mod select;
#[cfg(unix)]
pub use self::select::SelectBackend;

mod poll;
pub use self::poll::PollBackend;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::epoll::EpollBackend;

#[cfg(windows)]
mod winmsg;
#[cfg(windows)]
pub use self::winmsg::{MessageBackend, MessageNotification};

/// What a back-end requires of a socket's blocking mode after a
/// [`watch`]/[`modify`] call.
///
/// Most back-ends leave the mode alone; the Windows message-driven back-end
/// switches sockets to non-blocking as a side effect of registration. The
/// reactor applies the returned adjustment before dispatching anything else
/// for the socket.
///
/// [`watch`]: Backend::watch
/// [`modify`]: Backend::modify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingAdjustment {
    /// The socket's blocking mode is unaffected.
    Unchanged,
    /// The socket must be put (or already was put) in non-blocking mode.
    NonBlocking,
    /// The socket must be put in blocking mode.
    Blocking,
}

/// A readiness back-end.
///
/// All back-ends share this contract; [`Multiplexer`] owns one as a trait
/// object. Registration masks are reduced to their requestable kinds
/// (`READABLE | WRITABLE | EXCEPT`); error, hang-up and invalid readiness are
/// reported regardless.
pub trait Backend {
    /// The mask `descriptor` is currently watched with, or the empty mask if
    /// it is unknown. Kernel-queue back-ends cannot introspect their set and
    /// always return the empty mask.
    fn watching(&self, descriptor: Descriptor) -> Ready;

    /// Start watching a previously-unwatched descriptor.
    ///
    /// Fails with `ENOBUFS` when the back-end has a fixed capacity and it is
    /// exhausted, and with `ErrorKind::AlreadyExists` when the descriptor is
    /// already in the set.
    fn watch(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment>;

    /// Change the mask of an already-watched descriptor.
    ///
    /// The default unwatches and re-watches; kernel back-ends override this
    /// with their native modify operation.
    fn modify(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        self.unwatch(descriptor)?;
        self.watch(descriptor, mask)
    }

    /// Stop watching a descriptor.
    fn unwatch(&mut self, descriptor: Descriptor) -> io::Result<()>;

    /// Stop watching a descriptor that is known to be closed already.
    ///
    /// Never fails: the `EBADF` the kernel would report for a dead
    /// descriptor is exactly what the caller expects and is swallowed.
    fn unwatch_dead(&mut self, descriptor: Descriptor);

    /// Drop every registration.
    fn clear(&mut self) -> io::Result<()>;

    /// Block until readiness or `timeout`, filling `events`.
    ///
    /// `None` means wait forever. Expiry of a finite timeout is reported as
    /// `ErrorKind::TimedOut`, never as success with zero events.
    fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()>;
}

/// Selects which back-end a [`Multiplexer`] is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// `select(2)` bitmap sets. Portable, capacity-bound by `FD_SETSIZE`.
    #[cfg(unix)]
    Select,
    /// `poll(2)` (`WSAPoll` on Windows) descriptor array.
    Poll,
    /// Linux `epoll(7)` kernel queue.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll,
    /// `WSAAsyncSelect` window messages. Cannot be constructed through
    /// [`Multiplexer::with_backend`] since it needs a notification target;
    /// build a [`MessageBackend`] and use [`Multiplexer::from_backend`].
    #[cfg(windows)]
    WindowsMessage,
}

impl BackendKind {
    /// The default back-end for the running platform: the kernel queue where
    /// one is available, the descriptor array elsewhere.
    pub fn default_for_platform() -> BackendKind {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            BackendKind::Epoll
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            BackendKind::Poll
        }
    }
}

/// The readiness multiplexer: a uniform interface over one owned back-end.
///
/// # Examples
///
/// ```no_run
/// use muxio::{Events, Multiplexer, Ready};
/// use std::time::Duration;
///
/// let mut mux = Multiplexer::new()?;
/// let mut events = Events::with_capacity(64);
/// # let descriptor = 0;
/// mux.watch(descriptor, Ready::READABLE)?;
/// mux.poll(&mut events, Some(Duration::from_millis(100)))?;
/// for event in &events {
///     println!("{:?} is {:?}", event.descriptor(), event.ready());
/// }
/// # Ok::<(), std::io::Error>(())
/// ```
pub struct Multiplexer {
    backend: Box<dyn Backend>,
    kind: BackendKind,
}

impl Multiplexer {
    /// A multiplexer over the platform's default back-end.
    pub fn new() -> io::Result<Multiplexer> {
        Multiplexer::with_backend(BackendKind::default_for_platform())
    }

    /// A multiplexer over an explicitly chosen back-end.
    pub fn with_backend(kind: BackendKind) -> io::Result<Multiplexer> {
        let backend: Box<dyn Backend> = match kind {
            #[cfg(unix)]
            BackendKind::Select => Box::new(SelectBackend::new()),
            BackendKind::Poll => Box::new(PollBackend::new()),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::Epoll => Box::new(EpollBackend::new()?),
            #[cfg(windows)]
            BackendKind::WindowsMessage => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "the message-driven back-end needs a notification target; \
                     construct it with Multiplexer::from_backend",
                ))
            }
        };
        Ok(Multiplexer { backend, kind })
    }

    /// A multiplexer over a caller-supplied back-end, e.g. the Windows
    /// message-driven one, which needs a notification target to construct.
    pub fn from_backend(kind: BackendKind, backend: Box<dyn Backend>) -> Multiplexer {
        Multiplexer { backend, kind }
    }

    /// Which back-end this multiplexer runs on.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// See [`Backend::watching`].
    pub fn watching(&self, descriptor: Descriptor) -> Ready {
        self.backend.watching(descriptor)
    }

    /// See [`Backend::watch`].
    pub fn watch(
        &mut self,
        descriptor: Descriptor,
        mask: Ready,
    ) -> io::Result<BlockingAdjustment> {
        log::trace!("watch {:?} with {:?}", descriptor, mask);
        self.backend.watch(descriptor, mask.requestable())
    }

    /// See [`Backend::modify`].
    pub fn modify(
        &mut self,
        descriptor: Descriptor,
        mask: Ready,
    ) -> io::Result<BlockingAdjustment> {
        log::trace!("modify {:?} to {:?}", descriptor, mask);
        self.backend.modify(descriptor, mask.requestable())
    }

    /// See [`Backend::unwatch`].
    pub fn unwatch(&mut self, descriptor: Descriptor) -> io::Result<()> {
        log::trace!("unwatch {:?}", descriptor);
        self.backend.unwatch(descriptor)
    }

    /// See [`Backend::unwatch_dead`].
    pub fn unwatch_dead(&mut self, descriptor: Descriptor) {
        log::trace!("unwatch dead {:?}", descriptor);
        self.backend.unwatch_dead(descriptor)
    }

    /// See [`Backend::clear`].
    pub fn clear(&mut self) -> io::Result<()> {
        self.backend.clear()
    }

    /// See [`Backend::poll`].
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.backend.poll(events, timeout)
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Multiplexer")
            .field("kind", &self.kind)
            .finish()
    }
}

/// Convert a poll timeout to whole milliseconds for back-ends whose wait
/// takes an `int` of milliseconds. Sub-millisecond remainders round up so a
/// short timeout is not silently turned into a busy-spin, unless the caller
/// explicitly asked for zero.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> io::Result<libc_int> {
    match timeout {
        None => Ok(-1),
        Some(to) => {
            let millis = to
                .checked_add(Duration::from_nanos(999_999))
                .unwrap_or(to)
                .as_millis();
            if millis > i32::MAX as u128 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "poll timeout exceeds i32::MAX milliseconds",
                ));
            }
            Ok(millis as libc_int)
        }
    }
}

#[cfg(unix)]
#[allow(non_camel_case_types)]
type libc_int = libc::c_int;
#[cfg(windows)]
#[allow(non_camel_case_types)]
type libc_int = i32;

/// The error a capacity-bound back-end reports when its set is full.
pub(crate) fn no_buffer_space() -> io::Error {
    #[cfg(unix)]
    {
        io::Error::from_raw_os_error(libc::ENOBUFS)
    }
    #[cfg(windows)]
    {
        io::Error::from_raw_os_error(
            windows_sys::Win32::Networking::WinSock::WSAENOBUFS,
        )
    }
}

pub(crate) fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "poll timed out")
}
