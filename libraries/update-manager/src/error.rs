use core::fmt;
use embedded_storage::nor_flash::NorFlashErrorKind;

/// Errors the engine can't recover from on its own
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Error {
    /// The session record couldn't be written or erased
    Persist(NorFlashErrorKind),
    /// The event queue is full
    QueueFull,
}

impl From<NorFlashErrorKind> for Error {
    fn from(value: NorFlashErrorKind) -> Self {
        Error::Persist(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Persist(e) => write!(f, "Failed to persist the session record ({:?})", e),
            Error::QueueFull => f.write_str("Event queue is full"),
        }
    }
}
