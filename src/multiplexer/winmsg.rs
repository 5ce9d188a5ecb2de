use std::collections::HashMap;
use std::io;
use std::time::Duration;

use windows_sys::Win32::Foundation::HWND;
use windows_sys::Win32::Networking::WinSock::{
    WSAAsyncSelect, FD_ACCEPT, FD_CLOSE, FD_CONNECT, FD_OOB, FD_READ, FD_WRITE, SOCKET,
};

use crate::multiplexer::{Backend, BlockingAdjustment};
use crate::{Descriptor, Events, Ready};

/// The Windows message-driven back-end.
///
/// `WSAAsyncSelect` routes readiness to a window procedure instead of a
/// pollable queue, so [`poll`] is a contract violation here and the reactor
/// is driven by [`Reactor::message_received`] with the `WPARAM`/`LPARAM` the
/// host's window procedure received.
///
/// Registration switches the socket to non-blocking mode as a side effect,
/// which is surfaced to the reactor as a [`BlockingAdjustment::NonBlocking`].
///
/// [`poll`]: Backend::poll
/// [`Reactor::message_received`]: crate::Reactor::message_received
pub struct MessageBackend {
    hwnd: HWND,
    message: u32,
    registered: HashMap<Descriptor, Ready>,
}

impl MessageBackend {
    /// A back-end notifying `hwnd` with `message` for every readiness change.
    pub fn new(hwnd: HWND, message: u32) -> MessageBackend {
        MessageBackend {
            hwnd,
            message,
            registered: HashMap::new(),
        }
    }
}

impl Backend for MessageBackend {
    fn watching(&self, descriptor: Descriptor) -> Ready {
        self.registered
            .get(&descriptor)
            .copied()
            .unwrap_or(Ready::EMPTY)
    }

    fn watch(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        if self.registered.contains_key(&descriptor) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        wsa_syscall!(WSAAsyncSelect(
            descriptor as SOCKET,
            self.hwnd,
            self.message,
            mask_to_fd_events(mask) as i32,
        ))?;
        self.registered.insert(descriptor, mask);
        Ok(BlockingAdjustment::NonBlocking)
    }

    fn modify(&mut self, descriptor: Descriptor, mask: Ready) -> io::Result<BlockingAdjustment> {
        if !self.registered.contains_key(&descriptor) {
            return Err(io::ErrorKind::NotFound.into());
        }
        wsa_syscall!(WSAAsyncSelect(
            descriptor as SOCKET,
            self.hwnd,
            self.message,
            mask_to_fd_events(mask) as i32,
        ))?;
        self.registered.insert(descriptor, mask);
        Ok(BlockingAdjustment::NonBlocking)
    }

    fn unwatch(&mut self, descriptor: Descriptor) -> io::Result<()> {
        if self.registered.remove(&descriptor).is_none() {
            return Err(io::ErrorKind::NotFound.into());
        }
        wsa_syscall!(WSAAsyncSelect(descriptor as SOCKET, self.hwnd, 0, 0))?;
        Ok(())
    }

    fn unwatch_dead(&mut self, descriptor: Descriptor) {
        // Closing the socket already cancelled the registration; the
        // cancelling call would only fail with WSAENOTSOCK.
        self.registered.remove(&descriptor);
    }

    fn clear(&mut self) -> io::Result<()> {
        let descriptors: Vec<_> = self.registered.keys().copied().collect();
        for descriptor in descriptors {
            self.unwatch(descriptor)?;
        }
        Ok(())
    }

    fn poll(&mut self, _events: &mut Events, _timeout: Option<Duration>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "the message-driven back-end cannot be polled; route window \
             messages to Reactor::message_received instead",
        ))
    }
}

/// One decoded `WSAAsyncSelect` notification.
#[derive(Debug, Clone, Copy)]
pub struct MessageNotification {
    /// The socket the notification is about.
    pub descriptor: Descriptor,
    /// Readiness kinds carried by the event word.
    pub ready: Ready,
    /// True when the event word names an accept notification.
    pub accept: bool,
    /// WinSock error code from the high word, zero when none.
    pub error: i32,
}

impl MessageNotification {
    /// Decode the `WPARAM`/`LPARAM` pair of an async-select window message.
    pub fn decode(wparam: usize, lparam: isize) -> MessageNotification {
        let event = (lparam & 0xFFFF) as u32;
        let error = ((lparam >> 16) & 0xFFFF) as i32;
        MessageNotification {
            descriptor: wparam as Descriptor,
            ready: fd_events_to_mask(event, error),
            accept: event & FD_ACCEPT != 0,
            error,
        }
    }
}

fn mask_to_fd_events(mask: Ready) -> u32 {
    let mut kind = FD_CLOSE;
    if mask.is_readable() {
        kind |= FD_READ | FD_ACCEPT | FD_CONNECT;
    }
    if mask.is_writable() {
        kind |= FD_WRITE;
    }
    if mask.is_except() {
        kind |= FD_OOB;
    }
    kind
}

fn fd_events_to_mask(event: u32, error: i32) -> Ready {
    let mut mask = Ready::EMPTY;
    if event & (FD_READ | FD_ACCEPT) != 0 {
        mask |= Ready::READABLE;
    }
    if event & (FD_WRITE | FD_CONNECT) != 0 {
        mask |= Ready::WRITABLE;
    }
    if event & FD_OOB != 0 {
        mask |= Ready::EXCEPT;
    }
    if event & FD_CLOSE != 0 {
        mask |= Ready::HANGUP;
    }
    if error != 0 {
        mask |= Ready::ERROR;
    }
    mask
}

impl std::fmt::Debug for MessageBackend {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("MessageBackend")
            .field("message", &self.message)
            .field("registered", &self.registered)
            .finish()
    }
}
