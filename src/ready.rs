use std::{fmt, ops};

/// A set of readiness kinds.
///
/// `Ready` serves double duty: as a *watch mask* it names the kinds of
/// readiness a descriptor is registered for, and as an *event mask* it names
/// the kinds a back-end actually observed. The two uses share one type
/// because they share the same bits; values can be combined with the usual
/// bitwise operators.
///
/// [`ERROR`], [`HANGUP`] and [`INVALID`] are output-only. They may appear in
/// delivered events but are never honoured in a registration mask; back-ends
/// report them whether asked to or not.
///
/// # Examples
///
/// ```
/// use muxio::Ready;
///
/// let ready = Ready::READABLE | Ready::WRITABLE;
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// assert!(!ready.is_hangup());
/// ```
///
/// [`ERROR`]: Ready::ERROR
/// [`HANGUP`]: Ready::HANGUP
/// [`INVALID`]: Ready::INVALID
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Hash)]
pub struct Ready(u8);

const READABLE: u8 = 0b00_0001;
const WRITABLE: u8 = 0b00_0010;
const EXCEPT: u8   = 0b00_0100;
const ERROR: u8    = 0b00_1000;
const HANGUP: u8   = 0b01_0000;
const INVALID: u8  = 0b10_0000;

impl Ready {
    /// The empty set.
    pub const EMPTY: Ready = Ready(0);

    /// Readable readiness: bytes (or a connection to accept) are available.
    pub const READABLE: Ready = Ready(READABLE);

    /// Writable readiness.
    pub const WRITABLE: Ready = Ready(WRITABLE);

    /// Exceptional-condition readiness, i.e. out-of-band data.
    pub const EXCEPT: Ready = Ready(EXCEPT);

    /// A persistent error was observed on the descriptor. Output-only.
    pub const ERROR: Ready = Ready(ERROR);

    /// The peer closed its end of the connection. Output-only.
    pub const HANGUP: Ready = Ready(HANGUP);

    /// The descriptor is not valid, e.g. already closed. Output-only.
    pub const INVALID: Ready = Ready(INVALID);

    /// The registration mask used for every reactor-managed socket: all
    /// input-capable kinds. Error, hang-up and invalid readiness are implied.
    pub const WATCH_ALL: Ready = Ready(READABLE | WRITABLE | EXCEPT);

    /// Returns true if the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the set includes readable readiness.
    pub fn is_readable(self) -> bool {
        self.contains(Ready::READABLE)
    }

    /// Returns true if the set includes writable readiness.
    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITABLE)
    }

    /// Returns true if the set includes out-of-band readiness.
    pub fn is_except(self) -> bool {
        self.contains(Ready::EXCEPT)
    }

    /// Returns true if the set includes error readiness.
    pub fn is_error(self) -> bool {
        self.contains(Ready::ERROR)
    }

    /// Returns true if the set includes hang-up readiness.
    pub fn is_hangup(self) -> bool {
        self.contains(Ready::HANGUP)
    }

    /// Returns true if the set flags the descriptor as invalid.
    pub fn is_invalid(self) -> bool {
        self.contains(Ready::INVALID)
    }

    /// Returns true if `self` contains every kind in `other`.
    pub fn contains(self, other: Ready) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Adds all kinds in `other` to the set.
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all kinds in `other` from the set.
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// The set restricted to kinds that may be requested from a back-end.
    pub(crate) fn requestable(self) -> Ready {
        self & Ready::WATCH_ALL
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::SubAssign for Ready {
    #[inline]
    fn sub_assign(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::READABLE, "READABLE"),
            (Ready::WRITABLE, "WRITABLE"),
            (Ready::EXCEPT, "EXCEPT"),
            (Ready::ERROR, "ERROR"),
            (Ready::HANGUP, "HANGUP"),
            (Ready::INVALID, "INVALID"),
        ];

        for (flag, msg) in flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}
