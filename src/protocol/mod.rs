mod packet;
mod recv_packet;
mod response_writer;

pub(crate) mod hex;
pub(crate) mod ptid;

pub use packet::{CapacityError, PacketBuf};
pub use recv_packet::{RecvError, RecvPacketBlocking, RecvdPacket};
pub use response_writer::{ResponseWriter, ResponseWriterError};


/// Split `buf` around the first occurrence of `sep`.
pub(crate) fn split1(buf: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    let i = buf.iter().position(|b| *b == sep)?;
    Some((&buf[..i], &buf[i + 1..]))
}

/// Split `buf` around the first occurrence of `sep`, mutably.
pub(crate) fn split1_mut(buf: &mut [u8], sep: u8) -> Option<(&mut [u8], &mut [u8])> {
    let i = buf.iter().position(|b| *b == sep)?;
    let (a, b) = buf.split_at_mut(i);
    Some((a, &mut b[1..]))
}
