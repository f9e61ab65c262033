use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use crate::conn::Connection;
use crate::conn::ConnectionExt;

impl Connection for TcpStream {
    type Error = std::io::Error;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        Write::write_all(self, buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Write::flush(self)
    }

    fn on_session_start(&mut self) -> Result<(), Self::Error> {
        // RSP trades many tiny packets; don't let Nagle batch them
        self.set_nodelay(true)
    }
}

impl ConnectionExt for TcpStream {
    fn read(&mut self) -> Result<u8, Self::Error> {
        self.set_nonblocking(false)?;

        let mut byte = 0u8;
        match Read::read(self, core::slice::from_mut(&mut byte))? {
            // a zero-length read is the peer closing the stream
            0 => Err(ErrorKind::UnexpectedEof.into()),
            _ => Ok(byte),
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, Self::Error> {
        // probe in non-blocking mode, then restore the blocking default so
        // a following read() cannot spin
        self.set_nonblocking(true)?;
        let mut byte = 0u8;
        let probed = TcpStream::peek(self, core::slice::from_mut(&mut byte));
        self.set_nonblocking(false)?;

        match probed {
            // EOF shows up as an empty peek; leave it for read() to report
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}
