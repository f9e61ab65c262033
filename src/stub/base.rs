use log::warn;

use super::prelude::*;
use super::{DisconnectReason, KillBehaviour, TID_DEFAULT};
use crate::common::Signal;
use crate::protocol::hex::{decode_hex, decode_hex_buf, decode_reg_val, encode_reg_val};
use crate::protocol::ptid::Ptid;
use crate::protocol::{split1, split1_mut};
use crate::stub::core_manager::CoreManager;
use crate::target::{ResetKind, ResumeRes};

impl GdbServerImpl {
    pub(crate) fn handle_base<T: Target, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let handler_status = match body[0] {
            // ------------------- Stop-reason reporting -------------------- //
            b'?' => {
                let core = self.current_core();
                if self.cores[core].is_live() {
                    // always TRAP, whatever the recorded cause; clients only
                    // use this reply to learn the current thread
                    self.write_stop_reply(res, core, Signal::SIGTRAP, false)?;
                } else {
                    match self.cores[core].stop_reason() {
                        ResumeRes::Exited(code) => self.write_exit_reply(res, core, code)?,
                        _ => res.write_str("W00")?,
                    }
                }
                HandlerStatus::Handled
            }

            // ----------------------- Register access ---------------------- //
            b'g' => {
                let core = self.current_core();
                let size = target.reg_size();
                let mut hex = [0u8; 16];
                for reg in 0..target.reg_count() {
                    let val = target.read_register(core, reg).handle_error()?;
                    encode_reg_val(&mut hex, val as u64, size, true);
                    res.write_all(&hex[..size * 2])?;
                }
                HandlerStatus::Handled
            }
            b'G' => {
                let core = self.current_core();
                let size = target.reg_size();
                let vals = &body[1..];
                if vals.len() != target.reg_count() * size * 2 {
                    return Err(Error::NonFatal(1));
                }
                for reg in 0..target.reg_count() {
                    let val = decode_reg_val(&vals[reg * size * 2..], size, true)
                        .map_err(|_| Error::NonFatal(1))?;
                    target
                        .write_register(core, reg, val as u32)
                        .handle_error()?;
                }
                HandlerStatus::NeedsOk
            }
            b'p' => {
                let core = self.current_core();
                let reg: usize = decode_hex(&body[1..]).map_err(|_| Error::NonFatal(1))?;
                if reg >= target.reg_count() {
                    return Err(Error::NonFatal(1));
                }
                let size = target.reg_size();
                let val = target.read_register(core, reg).handle_error()?;
                let mut hex = [0u8; 16];
                encode_reg_val(&mut hex, val as u64, size, true);
                res.write_all(&hex[..size * 2])?;
                HandlerStatus::Handled
            }
            b'P' => {
                let core = self.current_core();
                let (reg, val) = split1(&body[1..], b'=').ok_or(Error::NonFatal(1))?;
                let reg: usize = decode_hex(reg).map_err(|_| Error::NonFatal(1))?;
                if reg >= target.reg_count() {
                    return Err(Error::NonFatal(1));
                }
                let size = target.reg_size();
                let val = decode_reg_val(val, size, true).map_err(|_| Error::NonFatal(1))?;
                target
                    .write_register(core, reg, val as u32)
                    .handle_error()?;
                HandlerStatus::NeedsOk
            }

            // ------------------------ Memory access ----------------------- //
            b'm' => {
                let (addr, len) = split1(&body[1..], b',').ok_or(Error::NonFatal(1))?;
                let addr: u32 = decode_hex(addr).map_err(|_| Error::NonFatal(1))?;
                let len: usize = decode_hex(len).map_err(|_| Error::NonFatal(1))?;
                // the hex-encoded reply must fit the outbound buffer
                if len * 2 + 1 > self.packet_capacity {
                    return Err(Error::NonFatal(1));
                }

                let mut chunk = [0u8; 128];
                let mut at = addr;
                let mut remaining = len;
                while remaining != 0 {
                    let n = remaining.min(chunk.len());
                    target.read_mem(at, &mut chunk[..n]).handle_error()?;
                    res.write_hex_buf(&chunk[..n])?;
                    at = at.wrapping_add(n as u32);
                    remaining -= n;
                }
                HandlerStatus::Handled
            }
            b'M' => {
                let (hdr, data) = split1_mut(&mut body[1..], b':').ok_or(Error::NonFatal(1))?;
                let (addr, len) = split1(hdr, b',').ok_or(Error::NonFatal(1))?;
                let addr: u32 = decode_hex(addr).map_err(|_| Error::NonFatal(1))?;
                let len: usize = decode_hex(len).map_err(|_| Error::NonFatal(1))?;

                let data = decode_hex_buf(data).map_err(|_| Error::NonFatal(1))?;
                if data.len() != len {
                    return Err(Error::NonFatal(1));
                }
                if target.write_mem(addr, data).handle_error()? != len {
                    return Err(Error::NonFatal(1));
                }
                HandlerStatus::NeedsOk
            }
            b'X' => {
                // the codec already unescaped the binary payload in place
                let (hdr, data) = split1_mut(&mut body[1..], b':').ok_or(Error::NonFatal(1))?;
                let (addr, len) = split1(hdr, b',').ok_or(Error::NonFatal(1))?;
                let addr: u32 = decode_hex(addr).map_err(|_| Error::NonFatal(1))?;
                let len: usize = decode_hex(len).map_err(|_| Error::NonFatal(1))?;

                if data.len() != len {
                    return Err(Error::NonFatal(1));
                }
                // a zero-length X is only probing for binary-write support
                if len != 0 && target.write_mem(addr, data).handle_error()? != len {
                    return Err(Error::NonFatal(1));
                }
                HandlerStatus::NeedsOk
            }

            // ------------------------- Thread state ----------------------- //
            b'H' => {
                if body.len() < 3 {
                    return Err(Error::NonFatal(1));
                }
                let op = body[1];
                let ptid = Ptid::parse(&body[2..]).ok_or(Error::NonFatal(1))?;
                let id = ptid.pid.unwrap_or(ptid.tid);
                match op {
                    b'g' => {
                        let core = self.core_for_id(id).map_err(|_| Error::NonFatal(1))?;
                        self.current_ptid = (CoreManager::core2pid(core), TID_DEFAULT);
                    }
                    b'c' => self.resume_scope = id,
                    _ => return Err(Error::NonFatal(1)),
                }
                HandlerStatus::NeedsOk
            }
            b'T' => {
                let ptid = Ptid::parse(&body[1..]).ok_or(Error::NonFatal(1))?;
                let id = ptid.pid.unwrap_or(ptid.tid);
                let core = self.core_for_id(id).map_err(|_| Error::NonFatal(1))?;
                if !self.cores[core].is_live() {
                    return Err(Error::NonFatal(1));
                }
                HandlerStatus::NeedsOk
            }

            // ---------------------- Session lifecycle --------------------- //
            b'D' => {
                // manually write OK, since we need to return a DisconnectReason
                res.write_str("OK")?;
                HandlerStatus::Disconnect(DisconnectReason::Disconnect)
            }
            b'k' => match self.kill_behaviour {
                KillBehaviour::ResetOnKill => {
                    target.reset(ResetKind::Cold).handle_error()?;
                    self.cores.reset();
                    self.matchpoints.clear_all();
                    HandlerStatus::NoResponse
                }
                KillBehaviour::ExitOnKill => {
                    HandlerStatus::SilentExit(DisconnectReason::Kill)
                }
            },
            b'R' => {
                // the hex argument is historical and ignored
                target.reset(ResetKind::Cold).handle_error()?;
                self.cores.reset();
                self.matchpoints.clear_all();
                self.current_ptid = (super::PID_DEFAULT, TID_DEFAULT);
                HandlerStatus::NoResponse
            }

            other => {
                warn!("command {:?} routed to base handler", other as char);
                HandlerStatus::Handled
            }
        };
        Ok(handler_status)
    }
}
