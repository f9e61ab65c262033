//! The byte-stream transport seam.
//!
//! The server drives its transport one byte at a time: requests arrive via
//! blocking reads, replies go out and are flushed per packet, and the run
//! loop probes for the out-of-band `0x03` interrupt between instruction
//! slices. Any stream that can do those three things can carry a session;
//! an implementation for [`TcpStream`](std::net::TcpStream) is provided.

mod impls;

/// The writing half of a transport.
pub trait Connection {
    /// Transport-specific error type.
    type Error;

    /// Push every byte of `buf`, blocking until the transport accepts it.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Push a single byte (an ACK or NAK).
    fn write(&mut self, byte: u8) -> Result<(), Self::Error> {
        self.write_all(core::slice::from_ref(&byte))
    }

    /// Drive any internally buffered bytes out to the peer.
    ///
    /// A transport with no buffering of its own may make this a no-op.
    fn flush(&mut self) -> Result<(), Self::Error>;

    /// One-time setup, called before the first packet is exchanged.
    ///
    /// Defaults to doing nothing. The `TcpStream` implementation disables
    /// Nagle batching here; left on, it adds a round-trip stall to every
    /// `$packet`/`+` exchange.
    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// The reading half of a transport.
pub trait ConnectionExt: Connection {
    /// Pull the next byte, blocking until one arrives.
    ///
    /// A closed stream must report an error rather than block forever; the
    /// server treats that error as the client hanging up.
    fn read(&mut self) -> Result<u8, Self::Error>;

    /// Look at the next pending byte without consuming it, or `None` when
    /// nothing is pending.
    ///
    /// This must never block: the run loop calls it between instruction
    /// slices to catch the interrupt byte while cores are executing.
    fn peek(&mut self) -> Result<Option<u8>, Self::Error>;
}
