use std::fmt;
use std::io::{self, Read};
use std::net;

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsRawSocket, FromRawSocket, IntoRawSocket, OwnedSocket};

use crate::Descriptor;

/// Where a socket is in its lifecycle.
///
/// The reactor reads this after every callback: a socket that moved to
/// [`Disconnecting`], [`Unconnected`] or [`Errored`] while its hooks ran is
/// torn down once they return.
///
/// [`Disconnecting`]: SocketState::Disconnecting
/// [`Unconnected`]: SocketState::Unconnected
/// [`Errored`]: SocketState::Errored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No connection and none in progress.
    Unconnected,
    /// A hostname lookup is in progress.
    Resolving,
    /// A connect has been issued but not yet completed.
    Connecting,
    /// Connected to a peer.
    Connected,
    /// Bound to a local address.
    Bound,
    /// Bound and accepting connections.
    Listening,
    /// A graceful close is in progress, or the peer already closed.
    Disconnecting,
    /// A persistent error was observed.
    Errored,
}

impl SocketState {
    /// True for the states that end a connection's life in the reactor.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SocketState::Unconnected | SocketState::Disconnecting | SocketState::Errored
        )
    }
}

/// A descriptor-owning, buffer-owning socket.
///
/// `Socket` performs only non-blocking-style I/O primitives; readiness comes
/// from the [`Reactor`]. Output is write-behind: [`write`] queues bytes and
/// flushes as much as the kernel will take, and whatever remains is drained
/// by the reactor on writability. A [`send_source`] body source is pulled
/// into the output buffer the same way, so arbitrarily large bodies never
/// sit in memory at once.
///
/// Creating and connecting/binding sockets is left to `std::net`; a
/// connected or listening socket enters this world through the `From`
/// conversions or [`from_parts`].
///
/// [`Reactor`]: crate::Reactor
/// [`write`]: Socket::write
/// [`send_source`]: Socket::send_source
/// [`from_parts`]: Socket::from_parts
pub struct Socket {
    #[cfg(unix)]
    inner: OwnedFd,
    #[cfg(windows)]
    inner: OwnedSocket,
    state: SocketState,
    blocking: bool,
    out: Vec<u8>,
    // Sent prefix of `out`; compacted lazily so draining a large buffer is
    // not quadratic.
    out_at: usize,
    source: Option<Box<dyn Read>>,
    did_write: bool,
    peer_closed: bool,
}

const READ_CHUNK: usize = 4096;
const SOURCE_CHUNK: usize = 8192;

impl Socket {
    /// Assemble a socket from an owned descriptor, its lifecycle state, and
    /// its blocking mode.
    #[cfg(unix)]
    pub fn from_parts(inner: OwnedFd, state: SocketState, blocking: bool) -> Socket {
        Socket {
            inner,
            state,
            blocking,
            out: Vec::new(),
            out_at: 0,
            source: None,
            did_write: false,
            peer_closed: false,
        }
    }

    /// Assemble a socket from an owned descriptor, its lifecycle state, and
    /// its blocking mode.
    #[cfg(windows)]
    pub fn from_parts(inner: OwnedSocket, state: SocketState, blocking: bool) -> Socket {
        Socket {
            inner,
            state,
            blocking,
            out: Vec::new(),
            out_at: 0,
            source: None,
            did_write: false,
            peer_closed: false,
        }
    }

    /// The raw descriptor. The socket retains ownership.
    pub fn descriptor(&self) -> Descriptor {
        #[cfg(unix)]
        {
            self.inner.as_raw_fd()
        }
        #[cfg(windows)]
        {
            self.inner.as_raw_socket()
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SocketState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    /// True once the peer has closed its half of the connection.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Whether the socket is in blocking mode, as far as this type knows.
    /// The flag tracks [`set_blocking`] calls and the mode recorded at
    /// construction; it is not re-queried from the kernel.
    ///
    /// [`set_blocking`]: Socket::set_blocking
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Switch the descriptor's blocking mode.
    #[cfg(unix)]
    pub fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        let flags = if blocking {
            flags & !libc::O_NONBLOCK
        } else {
            flags | libc::O_NONBLOCK
        };
        syscall!(fcntl(fd, libc::F_SETFL, flags))?;
        self.blocking = blocking;
        Ok(())
    }

    /// Switch the descriptor's blocking mode.
    #[cfg(windows)]
    pub fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        use windows_sys::Win32::Networking::WinSock::{ioctlsocket, FIONBIO, SOCKET};
        let mut nonblocking: u32 = if blocking { 0 } else { 1 };
        wsa_syscall!(ioctlsocket(
            self.inner.as_raw_socket() as SOCKET,
            FIONBIO,
            &mut nonblocking,
        ))?;
        self.blocking = blocking;
        Ok(())
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// `Ok(0)` means the peer closed; the socket records that and a
    /// connected socket moves to [`SocketState::Disconnecting`]. A
    /// `WouldBlock` error is the normal "nothing more right now" signal on
    /// non-blocking sockets, not a failure.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.sys_read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.peer_closed = true;
            if self.state == SocketState::Connected {
                self.state = SocketState::Disconnecting;
            }
        }
        Ok(n)
    }

    /// Append everything currently readable to `out`, stopping at
    /// would-block or end-of-stream. Returns how many bytes were appended.
    ///
    /// On a blocking socket only the bytes the kernel already holds are
    /// taken, so the call never stalls waiting for more.
    pub fn read_all(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        if self.blocking {
            return self.read_available(out);
        }

        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    /// Read exactly the kernel-reported available byte count. Readable with
    /// zero available means end-of-stream, which `read` observes without
    /// blocking.
    fn read_available(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let available = self.available()?;
        if available == 0 {
            let mut probe = [0u8; 1];
            return match self.read(&mut probe) {
                Ok(0) => Ok(0),
                Ok(n) => {
                    out.extend_from_slice(&probe[..n]);
                    Ok(n)
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
                Err(err) => Err(err),
            };
        }

        let start = out.len();
        out.resize(start + available, 0);
        let mut filled = 0;
        while filled < available {
            match self.read(&mut out[start + filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    out.truncate(start + filled);
                    return Err(err);
                }
            }
        }
        out.truncate(start + filled);
        Ok(filled)
    }

    /// Bytes the kernel currently holds for reading (`FIONREAD`).
    #[cfg(unix)]
    pub fn available(&self) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        let mut count: libc::c_int = 0;
        syscall!(ioctl(fd, libc::FIONREAD as _, &mut count))?;
        Ok(count.max(0) as usize)
    }

    /// Bytes the kernel currently holds for reading (`FIONREAD`).
    #[cfg(windows)]
    pub fn available(&self) -> io::Result<usize> {
        use windows_sys::Win32::Networking::WinSock::{ioctlsocket, FIONREAD, SOCKET};
        let mut count: u32 = 0;
        wsa_syscall!(ioctlsocket(
            self.inner.as_raw_socket() as SOCKET,
            FIONREAD,
            &mut count,
        ))?;
        Ok(count as usize)
    }

    /// Queue `bytes` for sending and flush as much as possible immediately.
    ///
    /// Whatever the kernel does not take stays in the output buffer; the
    /// reactor notices via [`did_write`] and watches for writability until
    /// the buffer drains.
    ///
    /// [`did_write`]: Socket::did_write
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.did_write = true;
        self.out.extend_from_slice(bytes);
        self.flush()
    }

    /// Attach a body source whose bytes are pulled into the output buffer as
    /// the kernel drains it. On a blocking socket the whole source is sent
    /// before this returns; on a non-blocking one the reactor finishes the
    /// job across writability callbacks.
    pub fn send_source(&mut self, source: Box<dyn Read>) -> io::Result<()> {
        if self.source.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a body source is already being drained",
            ));
        }
        self.did_write = true;
        self.source = Some(source);
        self.flush()
    }

    /// Push buffered output (and source bytes) to the kernel until it is all
    /// gone or the write would block.
    pub fn flush(&mut self) -> io::Result<()> {
        loop {
            if self.out_at == self.out.len() {
                self.out.clear();
                self.out_at = 0;
                match self.source.take() {
                    None => return Ok(()),
                    Some(mut source) => {
                        let mut chunk = [0u8; SOURCE_CHUNK];
                        let n = source.read(&mut chunk)?;
                        if n == 0 {
                            // Source exhausted; it stays dropped.
                            continue;
                        }
                        self.out.extend_from_slice(&chunk[..n]);
                        self.source = Some(source);
                    }
                }
            }

            match self.sys_write() {
                Ok(n) => {
                    self.out_at += n;
                    self.compact();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Reclaim the sent prefix once it dominates the buffer, keeping the
    /// cost of removal amortized constant per byte.
    fn compact(&mut self) {
        if self.out_at == self.out.len() {
            self.out.clear();
            self.out_at = 0;
        } else if self.out_at > SOURCE_CHUNK && self.out_at >= self.out.len() / 2 {
            self.out.drain(..self.out_at);
            self.out_at = 0;
        }
    }

    /// True while buffered output or an unfinished body source remains.
    pub fn pending_write(&self) -> bool {
        self.out_at < self.out.len() || self.source.is_some()
    }

    /// Bytes currently queued in the output buffer.
    pub fn buffered(&self) -> usize {
        self.out.len() - self.out_at
    }

    /// True if [`write`]/[`send_source`] ran since the reactor last cleared
    /// the flag, i.e. since the current callback began.
    ///
    /// [`write`]: Socket::write
    /// [`send_source`]: Socket::send_source
    pub fn did_write(&self) -> bool {
        self.did_write
    }

    pub(crate) fn clear_did_write(&mut self) {
        self.did_write = false;
    }

    /// Begin a graceful close: flush what the kernel will take, shut down
    /// the write half, and move to [`SocketState::Disconnecting`]. The
    /// reactor removes the socket after the current callback returns.
    pub fn disconnect(&mut self) {
        if matches!(
            self.state,
            SocketState::Connected | SocketState::Connecting | SocketState::Disconnecting
        ) {
            let _ = self.flush();
            let _ = self.sys_shutdown_write();
            self.state = SocketState::Disconnecting;
        }
    }

    /// Take the pending socket-level error, if any (`SO_ERROR`).
    pub fn take_error(&self) -> Option<io::Error> {
        self.sys_take_error()
    }

    #[cfg(unix)]
    fn sys_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
    }

    #[cfg(windows)]
    fn sys_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        use windows_sys::Win32::Networking::WinSock::{recv, SOCKET};
        wsa_syscall!(recv(
            self.inner.as_raw_socket() as SOCKET,
            buf.as_mut_ptr(),
            buf.len() as i32,
            0,
        ))
        .map(|n| n as usize)
    }

    #[cfg(unix)]
    fn sys_write(&self) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        let unsent = &self.out[self.out_at..];
        syscall!(write(
            fd,
            unsent.as_ptr() as *const libc::c_void,
            unsent.len(),
        ))
        .map(|n| n as usize)
    }

    #[cfg(windows)]
    fn sys_write(&self) -> io::Result<usize> {
        use windows_sys::Win32::Networking::WinSock::{send, SOCKET};
        let unsent = &self.out[self.out_at..];
        wsa_syscall!(send(
            self.inner.as_raw_socket() as SOCKET,
            unsent.as_ptr(),
            unsent.len() as i32,
            0,
        ))
        .map(|n| n as usize)
    }

    #[cfg(unix)]
    fn sys_shutdown_write(&self) -> io::Result<()> {
        let fd = self.inner.as_raw_fd();
        syscall!(shutdown(fd, libc::SHUT_WR)).map(|_| ())
    }

    #[cfg(windows)]
    fn sys_shutdown_write(&self) -> io::Result<()> {
        use windows_sys::Win32::Networking::WinSock::{shutdown, SD_SEND, SOCKET};
        wsa_syscall!(shutdown(self.inner.as_raw_socket() as SOCKET, SD_SEND as i32)).map(|_| ())
    }

    #[cfg(unix)]
    fn sys_take_error(&self) -> Option<io::Error> {
        let fd = self.inner.as_raw_fd();
        let mut code: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let res = syscall!(getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut _ as *mut libc::c_void,
            &mut len,
        ));
        match res {
            Ok(_) if code != 0 => Some(io::Error::from_raw_os_error(code)),
            Ok(_) => None,
            Err(err) => Some(err),
        }
    }

    #[cfg(windows)]
    fn sys_take_error(&self) -> Option<io::Error> {
        use windows_sys::Win32::Networking::WinSock::{
            getsockopt, SOCKET, SOL_SOCKET, SO_ERROR,
        };
        let mut code: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as i32;
        let res = wsa_syscall!(getsockopt(
            self.inner.as_raw_socket() as SOCKET,
            SOL_SOCKET as i32,
            SO_ERROR as i32,
            &mut code as *mut _ as *mut u8,
            &mut len,
        ));
        match res {
            Ok(_) if code != 0 => Some(io::Error::from_raw_os_error(code)),
            Ok(_) => None,
            Err(err) => Some(err),
        }
    }

    /// Local address of the descriptor.
    #[cfg(unix)]
    pub fn local_addr(&self) -> io::Result<net::SocketAddr> {
        let fd = self.inner.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(&storage) }
    }

    /// Peer address of the descriptor.
    #[cfg(unix)]
    pub fn peer_addr(&self) -> io::Result<net::SocketAddr> {
        let fd = self.inner.as_raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
        unsafe { to_socket_addr(&storage) }
    }

    /// Accept one pending connection on a listening socket, returning the
    /// raw child descriptor. Blocking-mode policy is the caller's business.
    #[cfg(unix)]
    pub(crate) fn accept_raw(&self) -> io::Result<OwnedFd> {
        let fd = self.inner.as_raw_fd();

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let child = syscall!(accept4(
            fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        ))?;

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let child = {
            let child = syscall!(accept(fd, std::ptr::null_mut(), std::ptr::null_mut()))?;
            let _ = syscall!(fcntl(child, libc::F_SETFD, libc::FD_CLOEXEC));
            child
        };

        // SAFETY: accept returned a fresh, valid descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(child) })
    }

    /// Accept one pending connection on a listening socket, returning the
    /// raw child descriptor.
    #[cfg(windows)]
    pub(crate) fn accept_raw(&self) -> io::Result<OwnedSocket> {
        use windows_sys::Win32::Networking::WinSock::{accept, INVALID_SOCKET, SOCKET};
        let child = unsafe {
            accept(
                self.inner.as_raw_socket() as SOCKET,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if child == INVALID_SOCKET {
            return Err(io::Error::from_raw_os_error(unsafe {
                windows_sys::Win32::Networking::WinSock::WSAGetLastError()
            }));
        }
        // SAFETY: accept returned a fresh, valid socket.
        Ok(unsafe { OwnedSocket::from_raw_socket(child as _) })
    }
}

#[cfg(unix)]
unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<net::SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => {
            let addr = &*(storage as *const libc::sockaddr_in);
            let ip = net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Ok(net::SocketAddr::V4(net::SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = &*(storage as *const libc::sockaddr_in6);
            let ip = net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Ok(net::SocketAddr::V6(net::SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

#[cfg(unix)]
impl From<net::TcpStream> for Socket {
    /// Wrap a connected `std` stream. The stream is assumed to be in
    /// blocking mode; follow up with [`Socket::set_blocking`] otherwise.
    fn from(stream: net::TcpStream) -> Socket {
        let fd = unsafe { OwnedFd::from_raw_fd(stream.into_raw_fd()) };
        Socket::from_parts(fd, SocketState::Connected, true)
    }
}

#[cfg(unix)]
impl From<net::TcpListener> for Socket {
    /// Wrap a listening `std` socket. The listener is assumed to be in
    /// blocking mode; follow up with [`Socket::set_blocking`] otherwise.
    fn from(listener: net::TcpListener) -> Socket {
        let fd = unsafe { OwnedFd::from_raw_fd(listener.into_raw_fd()) };
        Socket::from_parts(fd, SocketState::Listening, true)
    }
}

#[cfg(windows)]
impl From<net::TcpStream> for Socket {
    fn from(stream: net::TcpStream) -> Socket {
        let sock = unsafe { OwnedSocket::from_raw_socket(stream.into_raw_socket()) };
        Socket::from_parts(sock, SocketState::Connected, true)
    }
}

#[cfg(windows)]
impl From<net::TcpListener> for Socket {
    fn from(listener: net::TcpListener) -> Socket {
        let sock = unsafe { OwnedSocket::from_raw_socket(listener.into_raw_socket()) };
        Socket::from_parts(sock, SocketState::Listening, true)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Socket")
            .field("descriptor", &self.descriptor())
            .field("state", &self.state)
            .field("blocking", &self.blocking)
            .field("buffered", &self.buffered())
            .finish()
    }
}

/// The per-socket capability set the reactor dispatches into.
///
/// Implementors bundle a [`Socket`] with whatever per-connection state their
/// protocol needs; the reactor finds the socket through [`socket`]/
/// [`socket_mut`] and calls the remaining hooks as readiness arrives. Every
/// hook runs to completion before the next is dispatched; none of them
/// should block.
///
/// An `Err` returned from [`ready_read`]/[`ready_write`]/[`accept`] is
/// routed to [`error`] and the connection is torn down.
///
/// [`socket`]: Handler::socket
/// [`socket_mut`]: Handler::socket_mut
/// [`ready_read`]: Handler::ready_read
/// [`ready_write`]: Handler::ready_write
/// [`accept`]: Handler::accept
/// [`error`]: Handler::error
pub trait Handler {
    /// The socket this handler drives.
    fn socket(&self) -> &Socket;

    /// Mutable access to the socket this handler drives.
    fn socket_mut(&mut self) -> &mut Socket;

    /// The descriptor is readable. The default drains and discards.
    fn ready_read(&mut self) -> io::Result<()> {
        let mut sink = Vec::new();
        self.socket_mut().read_all(&mut sink).map(|_| ())
    }

    /// The descriptor is writable. The default flushes buffered output.
    fn ready_write(&mut self) -> io::Result<()> {
        self.socket_mut().flush()
    }

    /// A listening socket accepted `peer`; manufacture the handler that will
    /// own it. Returning `Ok(None)` vetoes the connection: the peer socket
    /// is dropped, which closes it, and the accept loop moves on.
    ///
    /// The default vetoes everything; listeners implement this.
    fn accept(&mut self, peer: Socket) -> io::Result<Option<Box<dyn Handler>>> {
        drop(peer);
        Ok(None)
    }

    /// Called once, right after the reactor has registered this handler's
    /// freshly accepted socket.
    fn connected(&mut self) {}

    /// The peer hung up, or the socket reached a terminal state during a
    /// callback. `err` carries the pending socket error when there was one.
    fn disconnected(&mut self, err: Option<io::Error>) {
        let _ = err;
    }

    /// A persistent error was observed; the reactor tears the connection
    /// down after this returns.
    fn error(&mut self, err: &io::Error) {
        let _ = err;
    }
}
