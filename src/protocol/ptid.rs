//! GDB-style process/thread identifiers.
//!
//! On the wire a PTID is either `p<pid>.<tid>` / `p<pid>` (multiprocess
//! clients) or a bare `<tid>`. Each field is hex, with two reserved
//! encodings: `-1` addresses everything, `0` leaves the choice to the
//! server.

use core::num::NonZeroUsize;

use super::hex::decode_hex;
use super::split1;

/// One field of a PTID.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum IdKind {
    /// `-1`: every process/thread.
    All,
    /// `0`: any process/thread, server's pick.
    Any,
    /// A concrete ID.
    WithId(NonZeroUsize),
}

impl IdKind {
    fn parse(field: &[u8]) -> Option<IdKind> {
        if field == b"-1" {
            return Some(IdKind::All);
        }
        let id: usize = decode_hex(field).ok()?;
        Some(match NonZeroUsize::new(id) {
            None => IdKind::Any,
            Some(id) => IdKind::WithId(id),
        })
    }
}

/// A parsed PTID. `pid` is absent when the client sent the bare-TID form.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct Ptid {
    pub pid: Option<IdKind>,
    pub tid: IdKind,
}

impl Ptid {
    pub fn parse(buf: &[u8]) -> Option<Ptid> {
        let (pid, tid) = match buf.strip_prefix(b"p") {
            Some(rest) => match split1(rest, b'.') {
                Some((pid, tid)) => (Some(IdKind::parse(pid)?), IdKind::parse(tid)?),
                // a lone p<pid> addresses every thread of that process
                None => (Some(IdKind::parse(rest)?), IdKind::All),
            },
            None => (None, IdKind::parse(buf)?),
        };
        Some(Ptid { pid, tid })
    }
}
