//! Target-to-host File-I/O: the `F` request/reply dialogue.
//!
//! A core that traps into a syscall stops with [`ResumeRes::Syscall`]; the
//! server translates the call into a GDB File-I/O request and parks the core
//! until the `F` reply arrives. The client may read and write target memory
//! while the call is in flight, so the packet pump keeps running.

use log::{info, warn};

use super::prelude::*;
use crate::conn::ConnectionExt;
use crate::protocol::hex::decode_hex;
use crate::protocol::{PacketBuf, ResponseWriter};
use crate::target::{ResumeRes, SyscallArgs, TargetError};

// RV32 newlib syscall numbers.
const SYS_CLOSE: u32 = 57;
const SYS_LSEEK: u32 = 62;
const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_EXIT: u32 = 93;
const SYS_OPEN: u32 = 1024;
const SYS_UNLINK: u32 = 1026;

const ENOSYS: u32 = 88;

/// Upper bound on the NUL scan for path arguments.
const MAX_PATH_SCAN: usize = 4096;

pub(crate) enum SyscallOutcome {
    /// An `F` request went out; the core waits for the reply.
    Forwarded,
    /// Handled in-server (exit, or ENOSYS); no host round trip.
    Completed,
}

impl GdbServerImpl {
    /// React to a core stopping with [`ResumeRes::Syscall`].
    pub(crate) fn start_syscall<T: Target, C: ConnectionExt>(
        &mut self,
        target: &mut T,
        conn: &mut C,
        out: &mut PacketBuf,
        core: usize,
    ) -> Result<SyscallOutcome, Error<T::Error, C::Error>> {
        // nested syscalls violate the protocol; this is a target bug, not a
        // recoverable condition
        assert!(
            self.syscall_core.is_none(),
            "core {} raised a syscall while core {:?} has one in flight",
            core,
            self.syscall_core
        );

        let args = match target.syscall_args(core) {
            Ok(args) => args,
            Err(TargetError::Fatal(e)) => return Err(Error::TargetError(e)),
            Err(_) => {
                warn!("core {} stopped for a syscall it cannot describe", core);
                self.cores[core].set_resume(None);
                self.cores[core].set_stop_reason(ResumeRes::Failed);
                return Ok(SyscallOutcome::Completed);
            }
        };

        let SyscallArgs { num, args: a } = args;

        if num == SYS_EXIT {
            let code = a[0] as u8;
            info!("core {} exited with status {}", core, code);
            self.cores[core].set_resume(None);
            self.cores[core].set_stop_reason(ResumeRes::Exited(code));
            if self.kill_core_on_exit {
                self.cores.kill_core(core);
            }
            return Ok(SyscallOutcome::Completed);
        }

        let mut res = ResponseWriter::new(conn, out, self.trace.rsp);
        match num {
            SYS_OPEN => {
                let len = self.string_length(target, a[0]).map_err(Error::TargetError)? + 1;
                res.write_str("Fopen,")?;
                res.write_num(a[0])?;
                res.write(b'/')?;
                res.write_num(len as u64)?;
                res.write(b',')?;
                res.write_num(a[1])?;
                res.write(b',')?;
                res.write_num(a[2])?;
            }
            SYS_CLOSE => {
                res.write_str("Fclose,")?;
                res.write_num(a[0])?;
            }
            SYS_READ => {
                res.write_str("Fread,")?;
                res.write_num(a[0])?;
                res.write(b',')?;
                res.write_num(a[1])?;
                res.write(b',')?;
                res.write_num(a[2])?;
            }
            SYS_WRITE => {
                res.write_str("Fwrite,")?;
                res.write_num(a[0])?;
                res.write(b',')?;
                res.write_num(a[1])?;
                res.write(b',')?;
                res.write_num(a[2])?;
            }
            SYS_LSEEK => {
                res.write_str("Flseek,")?;
                res.write_num(a[0])?;
                res.write(b',')?;
                res.write_num(a[1])?;
                res.write(b',')?;
                res.write_num(a[2])?;
            }
            SYS_UNLINK => {
                let len = self.string_length(target, a[0]).map_err(Error::TargetError)? + 1;
                res.write_str("Funlink,")?;
                res.write_num(a[0])?;
                res.write(b'/')?;
                res.write_num(len as u64)?;
            }
            other => {
                warn!("core {}: unsupported syscall {}; returning ENOSYS", core, other);
                drop(res);
                match target.syscall_result(core, -1, ENOSYS) {
                    Ok(()) => {}
                    Err(TargetError::Fatal(e)) => return Err(Error::TargetError(e)),
                    Err(_) => warn!("core {} rejected the ENOSYS result", core),
                }
                // the core never stopped as far as the client is concerned
                return Ok(SyscallOutcome::Completed);
            }
        }
        res.flush()?;

        self.syscall_core = Some(core);
        Ok(SyscallOutcome::Forwarded)
    }

    /// `F<retcode>[,<errno>[,C]]` — the host's answer to a File-I/O request.
    pub(crate) fn handle_syscall_reply<T: Target, C: ConnectionExt>(
        &mut self,
        _res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let core = match self.syscall_core.take() {
            Some(core) => core,
            None => {
                warn!("F reply with no syscall in flight; ignored");
                return Ok(HandlerStatus::Handled);
            }
        };

        let mut fields = body[1..].split(|b| *b == b',');

        let ret = fields.next().ok_or(Error::NonFatal(1))?;
        let ret: i64 = match ret.strip_prefix(b"-") {
            Some(mag) => -(decode_hex::<i64>(mag).map_err(|_| Error::NonFatal(1))?),
            None => decode_hex(ret).map_err(|_| Error::NonFatal(1))?,
        };
        let errno: u32 = match fields.next() {
            Some(errno) if !errno.is_empty() && errno != b"C" => {
                decode_hex(errno).map_err(|_| Error::NonFatal(1))?
            }
            _ => 0,
        };
        let ctrl_c = body[1..].split(|b| *b == b',').any(|f| f == b"C");

        target.syscall_result(core, ret, errno).handle_error()?;

        if ctrl_c {
            // the host call was interrupted: park the core with an INT stop
            // instead of resuming it
            self.cores[core].set_resume(None);
            self.cores[core].set_stop_reason(ResumeRes::Interrupted);
        }

        // back into the run loop: either the core keeps executing, or the
        // interrupt stop is reported immediately
        Ok(HandlerStatus::Resume)
    }

    /// Length of the NUL-terminated string at `addr` (exclusive of the NUL).
    fn string_length<T: Target>(&self, target: &mut T, addr: u32) -> Result<usize, T::Error> {
        let mut len = 0usize;
        let mut chunk = [0u8; 64];
        while len < MAX_PATH_SCAN {
            match target.read_mem(addr.wrapping_add(len as u32), &mut chunk) {
                Ok(()) => {}
                Err(TargetError::Fatal(e)) => return Err(e),
                // unreadable memory ends the scan; the host will fault the
                // request instead
                Err(_) => break,
            }
            if let Some(i) = chunk.iter().position(|b| *b == 0) {
                return Ok(len + i);
            }
            len += chunk.len();
        }
        Ok(len)
    }
}
