//! A cross-platform, event-driven networking core.
//!
//! Three pieces fit together here:
//!
//! * A readiness [`Multiplexer`] with interchangeable back-ends
//!   (`select`-style bitmaps, `poll`-style arrays, Linux `epoll`, and a
//!   Windows message-driven variant), behind one [`multiplexer::Backend`]
//!   contract.
//! * A single-threaded [`Reactor`] that owns registered sockets, pumps the
//!   multiplexer and dispatches readiness to per-socket [`Handler`] hooks,
//!   with write-backpressure and hang-up bookkeeping handled for you.
//! * A streaming [HTTP/1.x layer](http) built as `Handler` implementations:
//!   incremental parsing in, buffered serialization out, nothing blocking.
//!
//! Socket creation stays in `std::net`; a connected or listening socket is
//! wrapped in a [`Socket`] and handed to the reactor.
//!
//! # Example
//!
//! An echo server:
//!
//! ```no_run
//! use muxio::{Handler, Reactor, Socket};
//! use std::io;
//! use std::net::TcpListener;
//!
//! struct Echo {
//!     socket: Socket,
//! }
//!
//! impl Handler for Echo {
//!     fn socket(&self) -> &Socket {
//!         &self.socket
//!     }
//!
//!     fn socket_mut(&mut self) -> &mut Socket {
//!         &mut self.socket
//!     }
//!
//!     fn ready_read(&mut self) -> io::Result<()> {
//!         let mut bytes = Vec::new();
//!         self.socket.read_all(&mut bytes)?;
//!         self.socket.write(&bytes)
//!     }
//! }
//!
//! struct Acceptor {
//!     socket: Socket,
//! }
//!
//! impl Handler for Acceptor {
//!     fn socket(&self) -> &Socket {
//!         &self.socket
//!     }
//!
//!     fn socket_mut(&mut self) -> &mut Socket {
//!         &mut self.socket
//!     }
//!
//!     fn accept(&mut self, peer: Socket) -> io::Result<Option<Box<dyn Handler>>> {
//!         Ok(Some(Box::new(Echo { socket: peer })))
//!     }
//! }
//!
//! let listener = TcpListener::bind("127.0.0.1:7000")?;
//! listener.set_nonblocking(true)?;
//! let mut socket = Socket::from(listener);
//! socket.set_blocking(false)?;
//!
//! let mut reactor = Reactor::new()?;
//! reactor.serve(Box::new(Acceptor { socket }))?;
//! reactor.run()?;
//! # Ok::<(), io::Error>(())
//! ```
#![warn(missing_docs)]
#![allow(clippy::new_without_default)]

#[macro_use]
mod macros;

mod event;
mod ready;
mod reactor;
mod socket;

pub mod http;
pub mod multiplexer;

pub use event::{Event, Events};
pub use multiplexer::{BackendKind, BlockingAdjustment, Multiplexer};
pub use ready::Ready;
pub use reactor::{Cancel, Reactor};
pub use socket::{Handler, Socket, SocketState};

/// The platform's raw socket descriptor.
#[cfg(unix)]
pub type Descriptor = std::os::fd::RawFd;

/// The platform's raw socket descriptor.
#[cfg(windows)]
pub type Descriptor = std::os::windows::io::RawSocket;
