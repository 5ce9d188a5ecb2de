use std::collections::HashMap;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::multiplexer::BlockingAdjustment;
#[cfg(windows)]
use crate::multiplexer::MessageNotification;
use crate::{Descriptor, Events, Handler, Multiplexer, Ready, Socket, SocketState};

/// A cancellation handle for a running [`Reactor`].
///
/// Cancellation is cooperative: the flag is observed between pumps, never
/// mid-poll. When prompt shutdown matters, drive the reactor with
/// [`Reactor::poll`] and a finite timeout instead of [`Reactor::run`].
#[derive(Debug, Clone)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
}

impl Cancel {
    /// Ask the reactor to stop after the current pump.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// The socket reactor: waits on a [`Multiplexer`] and dispatches readiness
/// to per-socket [`Handler`]s.
///
/// Two maps hold the registered handlers. *Clients* are sockets the reactor
/// accepted itself; it owns them outright and drops them on teardown.
/// *Guests* arrived through [`serve`] and can be reclaimed with [`unserve`];
/// [`run`] keeps going for as long as any guest remains; the guests
/// (listeners, user-initiated connections) are the reason the loop exists.
///
/// A descriptor lives in exactly one of the two maps, and the multiplexer's
/// set is always the union of both.
///
/// Everything is single-threaded and callbacks run to completion; the only
/// blocking point is the multiplexer's poll.
///
/// [`serve`]: Reactor::serve
/// [`unserve`]: Reactor::unserve
/// [`run`]: Reactor::run
pub struct Reactor {
    mux: Multiplexer,
    clients: HashMap<Descriptor, Box<dyn Handler>>,
    guests: HashMap<Descriptor, Box<dyn Handler>>,
    events: Events,
    cancel: Arc<AtomicBool>,
    on_error: Option<Box<dyn FnMut(&io::Error)>>,
}

impl Reactor {
    /// A reactor over the platform's default multiplexer back-end.
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor::with_multiplexer(Multiplexer::new()?))
    }

    /// A reactor over an explicitly constructed multiplexer.
    pub fn with_multiplexer(mux: Multiplexer) -> Reactor {
        Reactor {
            mux,
            clients: HashMap::new(),
            guests: HashMap::new(),
            events: Events::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            on_error: None,
        }
    }

    /// A handle that cancels [`run`] from a callback or another thread.
    ///
    /// [`run`]: Reactor::run
    pub fn cancel_handle(&self) -> Cancel {
        Cancel {
            flag: Arc::clone(&self.cancel),
        }
    }

    /// Install a reactor-level error callback. It observes every error that
    /// is also delivered to a socket's [`Handler::error`] hook, plus errors
    /// with no socket to blame.
    pub fn on_error<F>(&mut self, callback: F)
    where
        F: FnMut(&io::Error) + 'static,
    {
        self.on_error = Some(Box::new(callback));
    }

    /// The multiplexer this reactor pumps.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Number of reactor-owned (accepted) sockets.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Number of guest (served) sockets.
    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    /// True if `descriptor` is registered, in either map.
    pub fn is_registered(&self, descriptor: Descriptor) -> bool {
        self.clients.contains_key(&descriptor) || self.guests.contains_key(&descriptor)
    }

    /// Register a user-owned handler and watch its socket for everything.
    ///
    /// The handler joins the guest map; ownership can be taken back with
    /// [`unserve`]. Fails with `AlreadyExists` if the descriptor is already
    /// registered.
    ///
    /// [`unserve`]: Reactor::unserve
    pub fn serve(&mut self, mut handler: Box<dyn Handler>) -> io::Result<()> {
        let descriptor = handler.socket().descriptor();
        if self.is_registered(descriptor) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }

        let adjustment = self.mux.watch(descriptor, Ready::WATCH_ALL)?;
        apply_adjustment(handler.socket_mut(), adjustment)?;
        self.guests.insert(descriptor, handler);
        Ok(())
    }

    /// Unregister a guest and hand its handler back.
    pub fn unserve(&mut self, descriptor: Descriptor) -> Option<Box<dyn Handler>> {
        let handler = self.guests.remove(&descriptor)?;
        let _ = self.mux.unwatch(descriptor);
        Some(handler)
    }

    /// Pump until cancelled or until no guest remains.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.cancel.load(Ordering::Relaxed) && !self.guests.is_empty() {
            match self.poll(None) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => {
                    // Multiplexer failure with no socket to blame cancels
                    // the loop.
                    self.report(&err);
                    return Err(err);
                }
            }
            thread::yield_now();
        }
        Ok(())
    }

    /// One multiplexer pump: wait up to `timeout`, then dispatch whatever
    /// came back. Expiry of a finite timeout surfaces as `TimedOut`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut events = mem::take(&mut self.events);
        let res = self.mux.poll(&mut events, timeout);
        if res.is_ok() {
            for event in &events {
                self.dispatch(event.descriptor(), event.ready());
            }
        }
        events.clear();
        self.events = events;
        res
    }

    /// Entry point for the Windows message-driven back-end: decode and
    /// dispatch one `WSAAsyncSelect` notification routed here by the host's
    /// window procedure.
    #[cfg(windows)]
    pub fn message_received(&mut self, wparam: usize, lparam: isize) {
        let note = MessageNotification::decode(wparam, lparam);
        self.dispatch(note.descriptor, note.ready);
    }

    fn dispatch(&mut self, descriptor: Descriptor, ready: Ready) {
        // The handler leaves its map for the duration of the dispatch; a
        // callback is then free to close or disconnect its own socket, and
        // erasure happens after the callbacks return.
        let (mut handler, owned) = match self.clients.remove(&descriptor) {
            Some(handler) => (handler, true),
            None => match self.guests.remove(&descriptor) {
                Some(handler) => (handler, false),
                None => return,
            },
        };

        log::trace!("dispatch {:?} for {:?}", ready, descriptor);

        if handler.socket().state() == SocketState::Listening {
            if ready.is_error() || ready.is_invalid() {
                let err = listener_error(handler.socket());
                handler.error(&err);
                self.report(&err);
                self.mux.unwatch_dead(descriptor);
                return;
            }
            if ready.is_readable() {
                self.accept_loop(&mut handler);
            }
            self.reinsert(descriptor, handler, owned);
            return;
        }

        handler.socket_mut().clear_did_write();

        let mut failure = None;
        if ready.is_error() || ready.is_invalid() {
            failure = Some(
                handler
                    .socket()
                    .take_error()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error")),
            );
        } else {
            if ready.is_readable() || ready.is_except() {
                if let Err(err) = handler.ready_read() {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        failure = Some(err);
                    }
                }
            }
            if failure.is_none() && ready.is_writable() {
                if let Err(err) = handler.ready_write() {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        failure = Some(err);
                    }
                }
            }
        }

        if let Some(err) = failure {
            handler.socket_mut().set_state(SocketState::Errored);
            handler.error(&err);
            self.report(&err);
            self.mux.unwatch_dead(descriptor);
            return;
        }

        // A hang-up nobody read from, or a socket that went terminal inside
        // a callback, ends the connection now that the callbacks are done.
        let hangup_unread = ready.is_hangup() && !ready.is_readable();
        if hangup_unread || handler.socket().state().is_terminal() {
            let err = handler.socket().take_error();
            handler.disconnected(err);
            self.mux.unwatch_dead(descriptor);
            return;
        }

        let adjustment = if handler.socket().did_write() {
            // Bytes were queued; make sure writability wakes us to drain.
            self.mux.modify(descriptor, Ready::WATCH_ALL)
        } else if ready.is_writable() && !handler.socket().pending_write() {
            // Nothing left to drain; stop being woken by writability.
            self.mux.modify(descriptor, Ready::WATCH_ALL - Ready::WRITABLE)
        } else {
            Ok(BlockingAdjustment::Unchanged)
        };

        match adjustment {
            Ok(adjustment) => {
                if let Err(err) = apply_adjustment(handler.socket_mut(), adjustment) {
                    self.report(&err);
                }
            }
            Err(err) => self.report(&err),
        }

        self.reinsert(descriptor, handler, owned);
    }

    /// Drain the listener's pending connections.
    fn accept_loop(&mut self, listener: &mut Box<dyn Handler>) {
        loop {
            let child = match listener.socket().accept_raw() {
                Ok(child) => child,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    listener.error(&err);
                    self.report(&err);
                    break;
                }
            };

            // On Linux accepted descriptors come out blocking regardless of
            // the listener's mode; elsewhere they inherit it.
            #[cfg(any(target_os = "linux", target_os = "android"))]
            let blocking = true;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let blocking = listener.socket().is_blocking();

            let peer = Socket::from_parts(child, SocketState::Connected, blocking);
            match listener.accept(peer) {
                // Admission veto: the peer socket was dropped, closing it.
                Ok(None) => {}
                Ok(Some(mut child_handler)) => {
                    let child_descriptor = child_handler.socket().descriptor();
                    match self.mux.watch(child_descriptor, Ready::WATCH_ALL) {
                        Ok(adjustment) => {
                            if let Err(err) =
                                apply_adjustment(child_handler.socket_mut(), adjustment)
                            {
                                child_handler.error(&err);
                                self.report(&err);
                                self.mux.unwatch_dead(child_descriptor);
                            } else {
                                self.clients.insert(child_descriptor, child_handler);
                                if let Some(child) = self.clients.get_mut(&child_descriptor) {
                                    child.connected();
                                }
                            }
                        }
                        Err(err) => {
                            child_handler.error(&err);
                            self.report(&err);
                        }
                    }
                }
                Err(err) => {
                    listener.error(&err);
                    self.report(&err);
                }
            }

            if listener.socket().is_blocking() {
                break;
            }
        }
    }

    fn reinsert(&mut self, descriptor: Descriptor, handler: Box<dyn Handler>, owned: bool) {
        if owned {
            self.clients.insert(descriptor, handler);
        } else {
            self.guests.insert(descriptor, handler);
        }
    }

    fn report(&mut self, err: &io::Error) {
        log::error!("reactor error: {}", err);
        if let Some(callback) = self.on_error.as_mut() {
            callback(err);
        }
    }
}

fn apply_adjustment(socket: &mut Socket, adjustment: BlockingAdjustment) -> io::Result<()> {
    match adjustment {
        BlockingAdjustment::Unchanged => Ok(()),
        BlockingAdjustment::NonBlocking if socket.is_blocking() => socket.set_blocking(false),
        BlockingAdjustment::Blocking if !socket.is_blocking() => socket.set_blocking(true),
        _ => Ok(()),
    }
}

fn listener_error(socket: &Socket) -> io::Error {
    socket
        .take_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "listener error"))
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Reactor")
            .field("multiplexer", &self.mux)
            .field("clients", &self.clients.len())
            .field("guests", &self.guests.len())
            .finish()
    }
}
