use log::{trace, warn};

use crate::conn::ConnectionExt;
use crate::protocol::hex::decode_hex;
use crate::protocol::packet::{CapacityError, PacketBuf};

/// The out-of-band interrupt character the client sends to stop a running
/// target.
const BREAK_CHAR: u8 = 0x03;

/// RLE count bytes below this value are not printable and never valid.
const RLE_BIAS: u8 = 29;

/// A complete inbound event from the transport.
pub enum RecvdPacket {
    /// A checksum-verified packet body is in the buffer (already unescaped
    /// and run-length expanded).
    Packet,
    /// A raw `0x03` seen between frames.
    Break,
}

/// Fatal receive-side errors. Checksum failures are not fatal: they are
/// NAK'd and the receiver re-synchronizes.
#[derive(Debug)]
pub enum RecvError<C> {
    /// Inbound frame exceeded the packet buffer.
    Capacity,
    Connection(C),
}

impl<C> From<CapacityError> for RecvError<C> {
    fn from(_: CapacityError) -> Self {
        RecvError::Capacity
    }
}

/// Receives frames by pulling bytes from a blocking connection.
///
/// `}`-escapes and `*`-run-lengths are decoded *while* the frame is read, so
/// the checksum is always verified against the raw wire bytes and the buffer
/// only ever holds the decoded body.
pub struct RecvPacketBlocking {}

impl RecvPacketBlocking {
    pub fn new() -> Self {
        RecvPacketBlocking {}
    }

    pub fn recv<C: ConnectionExt>(
        &mut self,
        pkt: &mut PacketBuf,
        conn: &mut C,
    ) -> Result<RecvdPacket, RecvError<C::Error>> {
        loop {
            let byte = conn.read().map_err(RecvError::Connection)?;
            match byte {
                BREAK_CHAR => return Ok(RecvdPacket::Break),
                b'$' => {
                    let ok = self.read_frame(pkt, conn)?;
                    let ack = if ok { b'+' } else { b'-' };
                    conn.write(ack).map_err(RecvError::Connection)?;
                    conn.flush().map_err(RecvError::Connection)?;

                    if ok {
                        trace!("<-- ${}#..", String::from_utf8_lossy(pkt.as_bytes()));
                        return Ok(RecvdPacket::Packet);
                    }
                    warn!("bad inbound frame (checksum or encoding); sent NAK");
                }
                // stray ACKs and line noise between frames
                _ => {}
            }
        }
    }

    /// Collect one frame body (the leading `$` is already consumed).
    /// Returns whether the claimed checksum matched the raw wire bytes.
    fn read_frame<C: ConnectionExt>(
        &mut self,
        pkt: &mut PacketBuf,
        conn: &mut C,
    ) -> Result<bool, RecvError<C::Error>> {
        let mut read = || conn.read().map_err(RecvError::Connection);

        'frame: loop {
            pkt.clear();
            let mut csum = 0u8;
            let mut poisoned = false;

            loop {
                let byte = read()?;
                match byte {
                    b'#' => {
                        let claimed = [read()?, read()?];
                        let verified = match decode_hex::<u8>(&claimed) {
                            Ok(c) => c == csum && !poisoned,
                            Err(_) => false,
                        };
                        return Ok(verified);
                    }
                    // an unescaped '$' means the client started over
                    b'$' => continue 'frame,
                    b'}' => {
                        let escaped = read()?;
                        csum = csum.wrapping_add(b'}').wrapping_add(escaped);
                        if !poisoned {
                            pkt.push(escaped ^ 0x20)?;
                        }
                    }
                    b'*' => {
                        let count = read()?;
                        csum = csum.wrapping_add(b'*').wrapping_add(count);
                        match pkt.last() {
                            Some(prev) if count >= RLE_BIAS => {
                                if !poisoned {
                                    for _ in 0..count - RLE_BIAS {
                                        pkt.push(prev)?;
                                    }
                                }
                            }
                            // a run with no subject, or an unprintable count:
                            // drain the frame and NAK it
                            _ => poisoned = true,
                        }
                    }
                    _ => {
                        csum = csum.wrapping_add(byte);
                        if !poisoned {
                            pkt.push(byte)?;
                        }
                    }
                }
            }
        }
    }
}
