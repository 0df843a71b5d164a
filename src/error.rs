/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Invalid arguments.
    InvalidArgs,
    /// No free slot, queue, or DMA mapping.
    NoResources,
    /// Admission limit reached and backlogging disallowed.
    Busy,
    /// The device transiently rejected a submission; the caller may
    /// retry immediately.
    Retry,
    /// Device-reported error or completion protocol violation.
    HardwareError,
    /// AEAD authentication failure on decryption.
    BadMessage,
    /// Out of memory.
    OutOfMemory,
    /// Unexpected engine state; never caused by a conforming caller.
    Internal,
}

/// error used in this crate
#[derive(Debug, Clone)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn msg(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::error::Error::with_msg($errno, $msg))
    };
}
