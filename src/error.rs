//! Crate-wide error taxonomy.
//!
//! Every fallible public operation returns [`Result<T>`]. Internal
//! invariant violations (AVL tree corruption, dangling free-list
//! bookkeeping) are not representable here: they go through
//! [`corrupt!`] and abort the process, matching the "RuntimeCorruption"
//! error kind this crate implements — a violated invariant implies
//! memory-safety loss, so it is not recoverable.

use core::fmt;

/// The error type returned by every fallible operation in this crate.
#[derive(Debug)]
pub enum Error {
    /// Bytes violate a PE/COFF invariant (bad magic, out-of-range
    /// field, malformed encoding). Raised during parse; the image is
    /// rejected.
    InvalidFormat(String),
    /// A data-stream read or RVA resolution refers outside any
    /// section, or past a section's virtual size.
    OutOfBounds {
        offset: usize,
        len: usize,
        bound: usize,
    },
    /// An operation was attempted against an allocation handle whose
    /// host section is gone, or was never assigned.
    Unallocated(String),
    /// Placing data at a specific offset collided with a live
    /// allocation or a live placed-offset.
    Overlap { offset: usize, len: usize },
    /// The host OS refused a virtual-memory reservation or release.
    OsResource(String),
    /// A `scroll` read/write failed (short buffer, bad UTF-16, ...).
    Scroll(scroll::Error),
    /// An I/O error bubbled up from a caller-supplied reader/writer.
    Io(std::io::Error),
    /// An integer did not fit the width required by the on-disk
    /// format (e.g. a section grew past `u32::MAX`).
    NumericOverflow(core::num::TryFromIntError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidFormat(msg) => write!(f, "invalid PE/COFF format: {msg}"),
            Error::OutOfBounds { offset, len, bound } => write!(
                f,
                "out of bounds: range [{offset}, {}) exceeds bound {bound}",
                offset + len
            ),
            Error::Unallocated(msg) => write!(f, "unallocated handle: {msg}"),
            Error::Overlap { offset, len } => {
                write!(f, "overlap at [{offset}, {})", offset + len)
            }
            Error::OsResource(msg) => write!(f, "OS virtual memory request failed: {msg}"),
            Error::Scroll(err) => write!(f, "scroll error: {err}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::NumericOverflow(err) => write!(f, "numeric overflow: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Scroll(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::NumericOverflow(err) => Some(err),
            _ => None,
        }
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Self {
        Error::Scroll(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<core::num::TryFromIntError> for Error {
    fn from(err: core::num::TryFromIntError) -> Self {
        Error::NumericOverflow(err)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Marker type used only in documentation to describe the conditions
/// that would trip a [`corrupt!`] assertion. Never constructed:
/// `RuntimeCorruption` does not return to callers.
#[derive(Debug)]
pub struct Corruption(core::convert::Infallible);

/// Fatal internal-invariant assertion. Formats a message and aborts
/// the process via `panic!`: a violated structural invariant implies
/// memory-safety loss and is not recoverable.
macro_rules! corrupt {
    ($($arg:tt)*) => {
        panic!("native heap / section allocator invariant violated: {}", format!($($arg)*))
    };
}

pub(crate) use corrupt;
