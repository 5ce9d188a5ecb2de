#![cfg(unix)]

mod util;

use std::io;
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

use muxio::{BackendKind, Events, Multiplexer, Ready};
use util::init;

fn backends() -> Vec<BackendKind> {
    let mut kinds = vec![BackendKind::Select, BackendKind::Poll];
    #[cfg(any(target_os = "linux", target_os = "android"))]
    kinds.push(BackendKind::Epoll);
    kinds
}

#[test]
fn watch_then_unwatch_leaves_no_trace() {
    init();

    for kind in [BackendKind::Select, BackendKind::Poll] {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = socket.as_raw_fd();

        mux.watch(fd, Ready::READABLE | Ready::WRITABLE).unwrap();
        assert_eq!(mux.watching(fd), Ready::READABLE | Ready::WRITABLE);

        mux.unwatch(fd).unwrap();
        assert_eq!(mux.watching(fd), Ready::EMPTY);
    }
}

#[test]
fn modify_same_mask_is_equivalent_to_plain_watch() {
    init();

    for kind in [BackendKind::Select, BackendKind::Poll] {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = socket.as_raw_fd();

        let mask = Ready::READABLE | Ready::WRITABLE;
        mux.watch(fd, mask).unwrap();
        mux.modify(fd, mask).unwrap();
        assert_eq!(mux.watching(fd), mask);
        mux.unwatch(fd).unwrap();
        assert_eq!(mux.watching(fd), Ready::EMPTY);

        // The descriptor is fully forgotten: a fresh watch succeeds.
        mux.watch(fd, Ready::READABLE).unwrap();
        assert_eq!(mux.watching(fd), Ready::READABLE);
    }
}

#[test]
fn double_watch_is_refused() {
    init();

    for kind in [BackendKind::Select, BackendKind::Poll] {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = socket.as_raw_fd();

        mux.watch(fd, Ready::READABLE).unwrap();
        let err = mux.watch(fd, Ready::READABLE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}

#[test]
fn output_only_kinds_are_not_requested() {
    init();

    let mut mux = Multiplexer::with_backend(BackendKind::Poll).unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let fd = socket.as_raw_fd();

    mux.watch(fd, Ready::READABLE | Ready::ERROR | Ready::HANGUP | Ready::INVALID)
        .unwrap();
    assert_eq!(mux.watching(fd), Ready::READABLE);
}

#[test]
fn select_refuses_descriptors_beyond_capacity() {
    init();

    let mut mux = Multiplexer::with_backend(BackendKind::Select).unwrap();
    let err = mux
        .watch(libc::FD_SETSIZE as i32, Ready::READABLE)
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOBUFS));
}

#[test]
fn poll_times_out_as_an_error_not_an_empty_success() {
    init();

    for kind in backends() {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        mux.watch(socket.as_raw_fd(), Ready::READABLE).unwrap();

        let mut events = Events::with_capacity(8);
        let err = mux
            .poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut, "{:?}", kind);
        assert!(events.is_empty());
    }
}

#[test]
fn oversized_timeout_is_invalid_argument() {
    init();

    for kind in backends() {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        mux.watch(socket.as_raw_fd(), Ready::READABLE).unwrap();

        let mut events = Events::with_capacity(8);
        let err = mux
            .poll(&mut events, Some(Duration::from_millis(i32::MAX as u64 + 1)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput, "{:?}", kind);
    }
}

#[test]
fn readiness_is_reported_on_every_backend() {
    init();

    for kind in backends() {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        mux.watch(fd, Ready::READABLE).unwrap();

        let _stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();

        let mut events = Events::with_capacity(8);
        mux.poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap_or_else(|err| panic!("poll failed on {:?}: {}", kind, err));

        let event = events
            .iter()
            .find(|event| event.descriptor() == fd)
            .unwrap_or_else(|| panic!("no event for the listener on {:?}", kind));
        assert!(event.ready().is_readable(), "{:?}", kind);
    }
}

#[test]
fn writability_is_reported_and_maskable() {
    init();

    for kind in backends() {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let (socket, _peer) = util::connected_pair();
        let fd = socket.descriptor();

        mux.watch(fd, Ready::WATCH_ALL).unwrap();
        let mut events = Events::with_capacity(8);
        mux.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        let event = events
            .iter()
            .find(|event| event.descriptor() == fd)
            .expect("no event for a writable socket");
        assert!(event.ready().is_writable(), "{:?}", kind);

        // Dropping the WRITABLE bit silences the wakeups.
        mux.modify(fd, Ready::WATCH_ALL - Ready::WRITABLE).unwrap();
        let err = mux
            .poll(&mut events, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut, "{:?}", kind);
    }
}

#[test]
fn unwatch_dead_forgets_a_closed_descriptor() {
    init();

    for kind in backends() {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = socket.as_raw_fd();
        mux.watch(fd, Ready::READABLE).unwrap();

        drop(socket);
        mux.unwatch_dead(fd);
        assert_eq!(mux.watching(fd), Ready::EMPTY);

        // The set stays usable afterwards.
        let other = UdpSocket::bind("127.0.0.1:0").unwrap();
        mux.watch(other.as_raw_fd(), Ready::READABLE).unwrap();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[test]
fn epoll_cannot_introspect_registrations() {
    init();

    let mut mux = Multiplexer::with_backend(BackendKind::Epoll).unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let fd = socket.as_raw_fd();
    mux.watch(fd, Ready::READABLE).unwrap();

    // The kernel set is write-only; callers must not rely on readback.
    assert_eq!(mux.watching(fd), Ready::EMPTY);
}

#[test]
fn clear_drops_every_registration() {
    init();

    for kind in backends() {
        let mut mux = Multiplexer::with_backend(kind).unwrap();
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        mux.watch(a.as_raw_fd(), Ready::READABLE).unwrap();
        mux.watch(b.as_raw_fd(), Ready::WRITABLE).unwrap();

        mux.clear().unwrap();
        assert_eq!(mux.watching(a.as_raw_fd()), Ready::EMPTY);

        // Registration works again from scratch.
        mux.watch(a.as_raw_fd(), Ready::READABLE).unwrap();
    }
}
