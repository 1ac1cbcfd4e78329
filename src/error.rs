//! Error types, one per concern.
//!
//! Allocation and control-call failures are returned to the immediate caller, never
//! swallowed. Per-operation failures are not errors at this layer at all: they travel as the
//! negative result code inside a [`Completion`] and are routed to whichever logical operation
//! issued the entry.
//!
//! [`Completion`]: ../ring/struct.Completion.html

use std::error::Error as StdError;
use std::io;
use std::fmt;

/// An error that can occur while creating a ring.
#[derive(Debug)]
pub enum SetupError {
    /// The requested capacity was zero or above the kernel maximum. Nothing was allocated.
    InvalidEntryCount(u32),
    /// The registration call itself failed; no descriptor was created.
    Setup(io::Error),
    /// Mapping one of the shared regions failed. The descriptor and any earlier mappings
    /// have already been released.
    Mmap(io::Error),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEntryCount(count) => {
                write!(f, "unsupported ring capacity: {}", count)
            }
            Self::Setup(err) => write!(f, "failed to create the ring: {}", err),
            Self::Mmap(err) => write!(f, "failed to map a ring region: {}", err),
        }
    }
}
impl StdError for SetupError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::InvalidEntryCount(_) => None,
            Self::Setup(err) | Self::Mmap(err) => Some(err),
        }
    }
}

/// An error that can occur when claiming a submission slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClaimError {
    /// No slot became available within the retry budget. Not a system fault; back off or
    /// widen batching and retry after a control call.
    Full,
    /// The ring has been closed.
    Closed,
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "submission ring is full"),
            Self::Closed => write!(f, "ring has been closed"),
        }
    }
}
impl StdError for ClaimError {}

impl From<ClaimError> for io::Error {
    fn from(error: ClaimError) -> io::Error {
        match error {
            ClaimError::Full => io::Error::new(io::ErrorKind::WouldBlock, error),
            ClaimError::Closed => io::Error::new(io::ErrorKind::NotConnected, error),
        }
    }
}

/// An error that can occur during the control call.
#[derive(Debug)]
pub enum EnterError {
    /// The ring has been closed.
    Closed,
    /// The call itself failed. The submission ring has been marked fillable again, so
    /// retrying is safe.
    Os(io::Error),
}

impl fmt::Display for EnterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "ring has been closed"),
            Self::Os(err) => write!(f, "io_uring_enter failed: {}", err),
        }
    }
}
impl StdError for EnterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Closed => None,
            Self::Os(err) => Some(err),
        }
    }
}

impl From<EnterError> for io::Error {
    fn from(error: EnterError) -> io::Error {
        match error {
            EnterError::Closed => io::Error::new(io::ErrorKind::NotConnected, error),
            EnterError::Os(err) => err,
        }
    }
}

/// An error that can occur when draining completions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainError {
    /// The ring has been closed.
    Closed,
}

impl fmt::Display for DrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "ring has been closed"),
        }
    }
}
impl StdError for DrainError {}

/// An error that can occur when registering fixed resources.
#[derive(Debug)]
pub enum RegisterError {
    /// The ring has been closed.
    Closed,
    /// The kernel rejected the registration (region not mappable, too many regions, or a
    /// table is already registered).
    Os(io::Error),
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "ring has been closed"),
            Self::Os(err) => write!(f, "io_uring_register failed: {}", err),
        }
    }
}
impl StdError for RegisterError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Closed => None,
            Self::Os(err) => Some(err),
        }
    }
}

impl From<RegisterError> for io::Error {
    fn from(error: RegisterError) -> io::Error {
        match error {
            RegisterError::Closed => io::Error::new(io::ErrorKind::NotConnected, error),
            RegisterError::Os(err) => err,
        }
    }
}

/// An error that can occur while tearing the ring down. If this is returned, the ring object
/// should be considered leaked: some kernel resource may still be held.
#[derive(Debug)]
pub enum TeardownError {
    /// Unmapping a shared region failed.
    Munmap(io::Error),
    /// Closing the ring descriptor failed.
    Close(io::Error),
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Munmap(err) => write!(f, "failed to unmap a ring region: {}", err),
            Self::Close(err) => write!(f, "failed to close the ring descriptor: {}", err),
        }
    }
}
impl StdError for TeardownError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Munmap(err) | Self::Close(err) => Some(err),
        }
    }
}
