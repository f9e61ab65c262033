use log::warn;

use super::prelude::*;
use super::BREAK_INSTR;
use crate::matchpoint::{MatchKind, Matchpoint};
use crate::protocol::hex::decode_hex;
use crate::protocol::split1;

impl GdbServerImpl {
    /// `Z` (insert) / `z` (remove) matchpoints: `Z<type>,<addr>,<kind>`.
    pub(crate) fn handle_matchpoint<T: Target, C: ConnectionExt>(
        &mut self,
        _res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let insert = body[0] == b'Z';

        let args = &body[1..];
        let (type_digit, rest) = match args.split_first() {
            Some(split) => split,
            None => return Err(Error::NonFatal(1)),
        };
        let kind = match MatchKind::from_type_digit(*type_digit) {
            Some(kind) => kind,
            None => {
                // an empty reply tells the client this type is unsupported
                warn!("unknown matchpoint type: {}", *type_digit as char);
                return Ok(HandlerStatus::Handled);
            }
        };

        let rest = rest.strip_prefix(b",").ok_or(Error::NonFatal(1))?;
        let (addr, len) = split1(rest, b',').ok_or(Error::NonFatal(1))?;
        let addr: u32 = decode_hex(addr).map_err(|_| Error::NonFatal(1))?;
        let len: usize = decode_hex(len).map_err(|_| Error::NonFatal(1))?;

        if kind == MatchKind::SoftBreak && !(1..=8).contains(&len) {
            return Err(Error::NonFatal(1));
        }

        match (insert, kind) {
            (true, MatchKind::SoftBreak) => {
                if self.matchpoints.contains(kind, addr) {
                    // GDB re-sends Z packets freely; keep the original saved
                    // bytes and report success
                    return Ok(HandlerStatus::NeedsOk);
                }

                let mut saved = vec![0u8; len];
                target.read_mem(addr, &mut saved).handle_error()?;

                let mut instr = vec![0u8; len];
                let n = len.min(4);
                instr[..n].copy_from_slice(&BREAK_INSTR.to_le_bytes()[..n]);
                if target.write_mem(addr, &instr).handle_error()? != len {
                    return Err(Error::NonFatal(1));
                }

                self.matchpoints.insert(Matchpoint {
                    kind,
                    addr,
                    len,
                    saved,
                });
                Ok(HandlerStatus::NeedsOk)
            }
            (false, MatchKind::SoftBreak) => {
                match self.matchpoints.remove(kind, addr) {
                    Some(mp) => {
                        // restore the displaced bytes, trusting the stored
                        // copy over whatever is in memory now
                        if target.write_mem(addr, &mp.saved).handle_error()? != mp.saved.len() {
                            return Err(Error::NonFatal(1));
                        }
                    }
                    None => warn!("remove of absent sw break at {:#x}; treated as success", addr),
                }
                Ok(HandlerStatus::NeedsOk)
            }
            (true, _) => {
                self.matchpoints.insert(Matchpoint {
                    kind,
                    addr,
                    len,
                    saved: Vec::new(),
                });
                Ok(HandlerStatus::NeedsOk)
            }
            (false, _) => {
                if self.matchpoints.remove(kind, addr).is_none() {
                    warn!(
                        "remove of absent {:?} at {:#x}; treated as success",
                        kind, addr
                    );
                }
                Ok(HandlerStatus::NeedsOk)
            }
        }
    }
}
