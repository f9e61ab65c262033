use log::{info, trace, warn};

use crate::common::{Pid, Tid};
use crate::conn::ConnectionExt;
use crate::protocol::hex::HEX_DIGITS;
use crate::protocol::packet::{CapacityError, PacketBuf};

/// Transmissions attempted per packet before the link is declared dead.
const MAX_SEND_ATTEMPTS: usize = 5;

/// Bytes that must be `}`-escaped in outbound payloads.
fn must_escape(byte: u8) -> bool {
    matches!(byte, b'#' | b'$' | b'}' | b'*')
}

#[derive(Debug)]
pub enum ResponseWriterError<C> {
    Connection(C),
    /// Response did not fit the outbound packet buffer.
    Capacity,
    /// The client NAK'd every transmission attempt.
    RetransmitFailed,
}

impl<C> From<CapacityError> for ResponseWriterError<C> {
    fn from(_: CapacityError) -> Self {
        ResponseWriterError::Capacity
    }
}

/// Builds one response body in the (reused) outbound buffer, then frames,
/// checksums, and transmits it, retransmitting on NAK.
///
/// Escaping happens at transmit time, so the buffer always holds the logical
/// payload and the checksum covers the escaped wire form.
pub struct ResponseWriter<'a, C: ConnectionExt> {
    conn: &'a mut C,
    buf: &'a mut PacketBuf,
    rsp_trace: bool,
}

impl<'a, C: ConnectionExt> ResponseWriter<'a, C> {
    pub fn new(conn: &'a mut C, buf: &'a mut PacketBuf, rsp_trace: bool) -> Self {
        buf.clear();
        ResponseWriter {
            conn,
            buf,
            rsp_trace,
        }
    }

    /// Discard anything buffered so far (turns a half-built reply into a
    /// clean slate for an `Enn`).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Append a single byte.
    pub fn write(&mut self, byte: u8) -> Result<(), ResponseWriterError<C::Error>> {
        self.buf.push(byte)?;
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), ResponseWriterError<C::Error>> {
        data.iter().try_for_each(|b| self.write(*b))
    }

    pub fn write_str(&mut self, s: &str) -> Result<(), ResponseWriterError<C::Error>> {
        self.write_all(s.as_bytes())
    }

    /// Append a single byte as two lowercase hex digits.
    pub fn write_hex(&mut self, byte: u8) -> Result<(), ResponseWriterError<C::Error>> {
        self.write(HEX_DIGITS[(byte >> 4) as usize])?;
        self.write(HEX_DIGITS[(byte & 0xf) as usize])
    }

    pub fn write_hex_buf(&mut self, data: &[u8]) -> Result<(), ResponseWriterError<C::Error>> {
        data.iter().try_for_each(|b| self.write_hex(*b))
    }

    /// Append a number as minimal-width lowercase hex.
    pub fn write_num(&mut self, val: impl Into<u64>) -> Result<(), ResponseWriterError<C::Error>> {
        let val: u64 = val.into();
        if val == 0 {
            return self.write(b'0');
        }
        let mut started = false;
        for i in (0..16).rev() {
            let digit = ((val >> (i * 4)) & 0xf) as usize;
            started |= digit != 0;
            if started {
                self.write(HEX_DIGITS[digit])?;
            }
        }
        Ok(())
    }

    /// Append a number in decimal (the `core:<n>;` attribute is decimal).
    pub fn write_dec(&mut self, val: u64) -> Result<(), ResponseWriterError<C::Error>> {
        let mut digits = [0u8; 20];
        let mut val = val;
        let mut i = digits.len();
        loop {
            i -= 1;
            digits[i] = b'0' + (val % 10) as u8;
            val /= 10;
            if val == 0 {
                break;
            }
        }
        self.write_all(&digits[i..])
    }

    /// Append a pid/tid in its wire form: `p<pid>.<tid>` when the client
    /// negotiated multiprocess, bare `<tid>` otherwise. IDs render as (at
    /// least) two lowercase hex digits.
    pub fn write_ptid(
        &mut self,
        pid: Option<Pid>,
        tid: Tid,
    ) -> Result<(), ResponseWriterError<C::Error>> {
        if let Some(pid) = pid {
            self.write(b'p')?;
            self.write_id(pid.get() as u64)?;
            self.write(b'.')?;
        }
        self.write_id(tid.get() as u64)
    }

    pub(crate) fn write_id(&mut self, id: u64) -> Result<(), ResponseWriterError<C::Error>> {
        if id <= 0xff {
            self.write_hex(id as u8)
        } else {
            self.write_num(id)
        }
    }

    /// Transmit the buffered body as an acknowledged `$…#cc` packet and
    /// clear the buffer. Most callers use the consuming [`flush`] instead;
    /// this exists for handlers that emit several packets (`O` console
    /// output, the non-stop `OK` ack).
    ///
    /// [`flush`]: Self::flush
    pub fn flush_now(&mut self) -> Result<(), ResponseWriterError<C::Error>> {
        if self.rsp_trace {
            info!("--> ${}#..", String::from_utf8_lossy(self.buf.as_bytes()));
        } else {
            trace!("--> ${}#..", String::from_utf8_lossy(self.buf.as_bytes()));
        }

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            self.transmit(b'$')?;
            if self.await_ack()? {
                self.buf.clear();
                return Ok(());
            }
            warn!(
                "client NAK'd response (attempt {}/{})",
                attempt, MAX_SEND_ATTEMPTS
            );
        }
        Err(ResponseWriterError::RetransmitFailed)
    }

    /// Consume self, transmitting the buffered body.
    pub fn flush(mut self) -> Result<(), ResponseWriterError<C::Error>> {
        self.flush_now()
    }

    /// Consume self, transmitting the buffered body as a `%…#cc`
    /// notification. Notifications are never acknowledged.
    pub fn flush_notification(self) -> Result<(), ResponseWriterError<C::Error>> {
        trace!("--> %{}#..", String::from_utf8_lossy(self.buf.as_bytes()));
        let mut this = self;
        this.transmit(b'%')?;
        this.buf.clear();
        Ok(())
    }

    /// Send `msg` to the client's console as an `O<hex>` packet, leaving the
    /// writer empty for the final reply. Only valid before the reply body
    /// has been started.
    pub fn console_write(&mut self, msg: &[u8]) -> Result<(), ResponseWriterError<C::Error>> {
        debug_assert!(self.buf.is_empty(), "console output after reply started");
        self.write(b'O')?;
        self.write_hex_buf(msg)?;
        self.flush_now()
    }

    fn transmit(&mut self, lead: u8) -> Result<(), ResponseWriterError<C::Error>> {
        let conn = &mut *self.conn;
        let mut put = |b: u8| conn.write(b).map_err(ResponseWriterError::Connection);

        let mut csum = 0u8;
        put(lead)?;
        for &b in self.buf.as_bytes() {
            if must_escape(b) {
                let escaped = b ^ 0x20;
                csum = csum.wrapping_add(b'}').wrapping_add(escaped);
                put(b'}')?;
                put(escaped)?;
            } else {
                csum = csum.wrapping_add(b);
                put(b)?;
            }
        }
        put(b'#')?;
        put(HEX_DIGITS[(csum >> 4) as usize])?;
        put(HEX_DIGITS[(csum & 0xf) as usize])?;
        self.conn.flush().map_err(ResponseWriterError::Connection)
    }

    fn await_ack(&mut self) -> Result<bool, ResponseWriterError<C::Error>> {
        loop {
            match self.conn.read().map_err(ResponseWriterError::Connection)? {
                b'+' => return Ok(true),
                b'-' => return Ok(false),
                other => trace!("ignoring {:#04x} while awaiting ack", other),
            }
        }
    }
}
