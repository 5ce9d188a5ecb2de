#![allow(unused_macros)]

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that uses them.
#[cfg(unix)]
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Like `syscall!`, but for WinSock calls that signal failure with
/// `SOCKET_ERROR` and report the cause via `WSAGetLastError`.
#[cfg(windows)]
macro_rules! wsa_syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { windows_sys::Win32::Networking::WinSock::$fn($($arg, )*) };
        if res == windows_sys::Win32::Networking::WinSock::SOCKET_ERROR {
            Err(std::io::Error::from_raw_os_error(unsafe {
                windows_sys::Win32::Networking::WinSock::WSAGetLastError()
            }))
        } else {
            Ok(res)
        }
    }};
}
