use core::fmt::{self, Debug, Display};

use crate::protocol::{RecvError, ResponseWriterError};

/// An error which may occur during a debugging session.
///
/// Generic over the target's fatal error type `T` and the connection's error
/// type `C`.
#[derive(Debug)]
pub enum Error<T, C> {
    /// Connection error while initializing the session.
    ConnectionInit(C),
    /// Connection error while reading a request.
    ConnectionRead(C),
    /// Connection error while writing a response.
    ConnectionWrite(C),
    /// A request or response did not fit in the packet buffer.
    PacketBufferOverflow,
    /// The client NAK'd a response more times than the retransmit budget
    /// allows.
    RetransmitFailed,
    /// The target reported a fatal error.
    TargetError(T),

    // Internal - a recoverable command failure (with errno-style code).
    //
    // This "dummy" error is how handlers bail out into an `Enn` reply; it is
    // intercepted by the packet pump and never propagated to the end user.
    #[doc(hidden)]
    NonFatal(u8),
}

impl<T, C> From<RecvError<C>> for Error<T, C> {
    fn from(e: RecvError<C>) -> Self {
        match e {
            RecvError::Capacity => Error::PacketBufferOverflow,
            RecvError::Connection(e) => Error::ConnectionRead(e),
        }
    }
}

impl<T, C> From<ResponseWriterError<C>> for Error<T, C> {
    fn from(e: ResponseWriterError<C>) -> Self {
        match e {
            ResponseWriterError::Connection(e) => Error::ConnectionWrite(e),
            ResponseWriterError::Capacity => Error::PacketBufferOverflow,
            ResponseWriterError::RetransmitFailed => Error::RetransmitFailed,
        }
    }
}

impl<T, C> Display for Error<T, C>
where
    T: Display,
    C: Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Error::*;
        match self {
            ConnectionInit(e) => write!(f, "connection error while initializing the session: {}", e),
            ConnectionRead(e) => write!(f, "connection error while reading a request: {}", e),
            ConnectionWrite(e) => write!(f, "connection error while writing a response: {}", e),
            PacketBufferOverflow => write!(f, "packet did not fit in the packet buffer"),
            RetransmitFailed => write!(f, "client NAK'd every retransmission of a response"),
            TargetError(e) => write!(f, "target reported a fatal error: {}", e),
            NonFatal(_) => write!(f, "internal non-fatal error. You should never see this!"),
        }
    }
}

impl<T, C> std::error::Error for Error<T, C>
where
    T: Debug + Display,
    C: Debug + Display,
{
}
