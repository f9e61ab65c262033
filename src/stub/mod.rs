//! The core [`GdbServer`] type, used to drive a debugging session for a
//! particular [`Target`] over a given [`Connection`](crate::conn::Connection).

use std::time::Duration;

use log::{info, warn};

use crate::common::{Pid, Tid, TraceFlags};
use crate::conn::ConnectionExt;
use crate::matchpoint::MpTable;
use crate::protocol::ptid::IdKind;
use crate::protocol::{PacketBuf, RecvPacketBlocking, RecvdPacket, ResponseWriter};
use crate::target::Target;

mod base;
mod breakpoints;
mod builder;
mod core_manager;
mod error;
mod monitor;
mod query;
mod resume;
mod syscall;

pub use builder::{GdbServerBuilder, GdbServerBuilderError};
pub use error::Error;

pub(crate) use core_manager::CoreManager;

/// Common imports used by every handler module.
mod prelude {
    pub(super) use super::error::Error;
    pub(super) use super::target_result_ext::TargetResultExt;
    pub(super) use super::{GdbServerImpl, HandlerStatus};
    pub(super) use crate::conn::ConnectionExt;
    pub(super) use crate::protocol::ResponseWriter;
    pub(super) use crate::target::Target;
}

pub(crate) mod target_result_ext {
    use super::error::Error;
    use crate::target::TargetError;

    /// Extension trait to ease working with `TargetResult` in the handler
    /// implementations.
    pub(crate) trait TargetResultExt<V, T, C> {
        /// Bail out on fatal errors; turn recoverable ones into the internal
        /// errno code that renders as an `Enn` reply.
        fn handle_error(self) -> Result<V, Error<T, C>>;
    }

    impl<V, T, C> TargetResultExt<V, T, C> for Result<V, TargetError<T>> {
        fn handle_error(self) -> Result<V, Error<T, C>> {
            let code = match self {
                Ok(v) => return Ok(v),
                Err(TargetError::Fatal(e)) => return Err(Error::TargetError(e)),
                // Recoverable errors:
                Err(TargetError::NonFatal) => 1,
                Err(TargetError::Errno(code)) => code,
            };

            Err(Error::NonFatal(code))
        }
    }
}

/// The little-endian `EBREAK` instruction planted for software breakpoints.
pub(crate) const BREAK_INSTR: u32 = 0x0010_0073;

/// Instructions executed per run-loop slice before the transport is polled
/// for a `0x03` interrupt.
pub(crate) const RUN_SAMPLE_PERIOD: u64 = 10_000;

/// The PID a fresh client debugs: core 0.
pub(crate) const PID_DEFAULT: Pid = match Pid::new(1) {
    Some(pid) => pid,
    None => unreachable!(),
};

/// Every core runs a single thread.
pub(crate) const TID_DEFAULT: Tid = PID_DEFAULT;

/// How the server reacts to a kill (`k`) packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillBehaviour {
    /// Reset the target, but remain alive for further debugging.
    ResetOnKill,
    /// Stop the target and end the session.
    ExitOnKill,
}

/// GDB's two stop-event delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Every core halts when any core stops; stop replies are synchronous.
    AllStop,
    /// Other cores keep running; stop events go out as `%Stop` notifications.
    NonStop,
}

/// Describes why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client detached (or asked the server to exit).
    Disconnect,
    /// The client issued a kill and the server is configured to exit on it.
    Kill,
    /// The last live core performed an exit syscall with the given status.
    TargetExited(u8),
}

/// What the packet pump should do once a handler returns.
pub(crate) enum HandlerStatus {
    /// Flush whatever the handler buffered (possibly an empty reply).
    Handled,
    /// Flush an `OK` reply.
    NeedsOk,
    /// Send nothing (`R`, and `k` when the server stays alive).
    NoResponse,
    /// Enter the run loop; the eventual stop reply closes the exchange.
    Resume,
    /// Flush the buffered reply, then end the session.
    Disconnect(DisconnectReason),
    /// End the session without sending anything.
    SilentExit(DisconnectReason),
}

bitflags::bitflags! {
    /// Protocol features negotiated via `qSupported`.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct ProtocolFeatures: u8 {
        const MULTIPROCESS = 1 << 0;
    }
}

/// Debug a [`Target`] over a given [`ConnectionExt`].
///
/// The server borrows both for its lifetime and owns everything else: the
/// two reused packet buffers, the matchpoint registry, and the per-core
/// bookkeeping.
pub struct GdbServer<'a, T: Target, C: ConnectionExt> {
    target: &'a mut T,
    conn: &'a mut C,
    pkt: PacketBuf,
    out: PacketBuf,
    recv: RecvPacketBlocking,
    inner: GdbServerImpl,
}

impl<'a, T: Target, C: ConnectionExt> GdbServer<'a, T, C> {
    /// Create a [`GdbServerBuilder`] for fine-grained control over server
    /// settings.
    pub fn builder(target: &'a mut T, conn: &'a mut C) -> GdbServerBuilder<'a, T, C> {
        GdbServerBuilder::new(target, conn)
    }

    /// Create a `GdbServer` with default settings.
    pub fn new(
        target: &'a mut T,
        conn: &'a mut C,
        trace_flags: TraceFlags,
        kill_behaviour: KillBehaviour,
    ) -> GdbServer<'a, T, C> {
        GdbServerBuilder::new(target, conn)
            .trace_flags(trace_flags)
            .kill_behaviour(kill_behaviour)
            .build()
            .unwrap() // default buffer sizing cannot fail validation
    }

    /// Serve RSP requests until the session ends.
    ///
    /// Returns how the session ended, or an `Err` for fatal conditions
    /// (transport closed, retransmit budget exhausted, target fatal error).
    /// The target and connection are borrowed, so a caller may loop around
    /// `run` to serve a fresh session after a clean detach.
    pub fn run(&mut self) -> Result<DisconnectReason, Error<T::Error, C::Error>> {
        self.conn
            .on_session_start()
            .map_err(Error::ConnectionInit)?;

        loop {
            if let Some(reason) = self.inner.exit_reason.take() {
                return Ok(reason);
            }

            match self.recv.recv(&mut self.pkt, &mut *self.conn)? {
                RecvdPacket::Break => {
                    warn!("interrupt byte while no core is running; ignored");
                    continue;
                }
                RecvdPacket::Packet => {}
            }

            if self.inner.trace.rsp {
                info!("<-- ${}#..", String::from_utf8_lossy(self.pkt.as_bytes()));
            }

            let body = self.pkt.as_mut_bytes();
            let mut res = ResponseWriter::new(&mut *self.conn, &mut self.out, self.inner.trace.rsp);

            let status = match self.inner.handle_command(&mut res, &mut *self.target, body) {
                Ok(status) => status,
                Err(Error::NonFatal(code)) => {
                    res.reset();
                    res.write(b'E')?;
                    res.write_hex(code)?;
                    HandlerStatus::Handled
                }
                Err(e) => return Err(e),
            };

            match status {
                HandlerStatus::Handled => res.flush()?,
                HandlerStatus::NeedsOk => {
                    res.write_str("OK")?;
                    res.flush()?;
                }
                HandlerStatus::NoResponse => {}
                HandlerStatus::Disconnect(reason) => {
                    res.flush()?;
                    return Ok(reason);
                }
                HandlerStatus::SilentExit(reason) => return Ok(reason),
                HandlerStatus::Resume => {
                    drop(res);
                    if let Some(reason) = self.inner.resume_and_report(
                        &mut *self.target,
                        &mut *self.conn,
                        &mut self.out,
                    )? {
                        return Ok(reason);
                    }
                }
            }
        }
    }
}

/// The protocol state machine, split from [`GdbServer`] so handlers can
/// borrow the packet buffers and the connection independently.
pub(crate) struct GdbServerImpl {
    pub(crate) cores: CoreManager,
    pub(crate) matchpoints: MpTable,
    pub(crate) trace: TraceFlags,
    pub(crate) kill_behaviour: KillBehaviour,
    pub(crate) kill_core_on_exit: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) stop_mode: StopMode,
    pub(crate) features: ProtocolFeatures,
    /// The PTID addressed by register/memory commands (`Hg`).
    pub(crate) current_ptid: (Pid, Tid),
    /// The scope addressed by legacy `c`/`s` resumes (`Hc`).
    pub(crate) resume_scope: IdKind,
    /// Cursor for `qfThreadInfo`/`qsThreadInfo` pagination.
    pub(crate) next_process: usize,
    /// Core whose File-I/O request is awaiting an `F` reply.
    pub(crate) syscall_core: Option<usize>,
    pub(crate) exit_reason: Option<DisconnectReason>,
    pub(crate) packet_capacity: usize,
}

impl GdbServerImpl {
    fn handle_command<T: Target, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let cmd = match body.first() {
            Some(cmd) => *cmd,
            // empty packet: reply in kind
            None => return Ok(HandlerStatus::Handled),
        };

        match cmd {
            b'?' | b'g' | b'G' | b'p' | b'P' | b'm' | b'M' | b'X' | b'H' | b'T' | b'D' | b'k'
            | b'R' => self.handle_base(res, target, body),
            b'q' | b'Q' => self.handle_query(res, target, body),
            b'Z' | b'z' => self.handle_matchpoint(res, target, body),
            b'v' | b'c' | b'C' | b's' | b'S' => self.handle_resume(res, target, body),
            b'F' => self.handle_syscall_reply(res, target, body),
            _ => {
                // the empty reply is how a stub says "unsupported"
                info!(
                    "unknown command: {:?}",
                    core::str::from_utf8(body).unwrap_or("<binary>")
                );
                Ok(HandlerStatus::Handled)
            }
        }
    }

    pub(crate) fn multiprocess(&self) -> bool {
        self.features.contains(ProtocolFeatures::MULTIPROCESS)
    }

    pub(crate) fn current_core(&self) -> usize {
        CoreManager::pid2core(self.current_ptid.0)
    }

    /// Resolve a parsed PTID to a core index. `Any` picks the first live
    /// core; `All` does not name a core and is rejected.
    pub(crate) fn core_for_id(&self, id: IdKind) -> Result<usize, ()> {
        match id {
            IdKind::Any => Ok((0..self.cores.cpu_count())
                .find(|&c| self.cores[c].is_live())
                .unwrap_or(0)),
            IdKind::All => Err(()),
            IdKind::WithId(id) => {
                let core = id.get() - 1;
                if core < self.cores.cpu_count() {
                    Ok(core)
                } else {
                    Err(())
                }
            }
        }
    }
}
