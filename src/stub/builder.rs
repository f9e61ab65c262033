use core::fmt::{self, Display};
use std::time::Duration;

use crate::common::TraceFlags;
use crate::conn::ConnectionExt;
use crate::matchpoint::MpTable;
use crate::protocol::ptid::IdKind;
use crate::protocol::{PacketBuf, RecvPacketBlocking};
use crate::target::Target;

use super::core_manager::CoreManager;
use super::{
    GdbServer, GdbServerImpl, KillBehaviour, ProtocolFeatures, StopMode, PID_DEFAULT, TID_DEFAULT,
};

/// Packet buffer capacity when the builder is not told otherwise.
const DEFAULT_PACKET_CAPACITY: usize = 0x400;

/// An error which may occur when building a [`GdbServer`].
#[derive(Debug)]
pub enum GdbServerBuilderError {
    /// The requested packet buffer cannot hold the mandatory exchanges
    /// (`max(256, 2 * regbytes + 1)` per the base protocol).
    PacketBufTooSmall { requested: usize, minimum: usize },
}

impl Display for GdbServerBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GdbServerBuilderError::PacketBufTooSmall { requested, minimum } => write!(
                f,
                "packet buffer of {} bytes cannot hold the initial dialogue (minimum {})",
                requested, minimum
            ),
        }
    }
}

impl std::error::Error for GdbServerBuilderError {}

/// Helper to construct and customize a [`GdbServer`].
pub struct GdbServerBuilder<'a, T: Target, C: ConnectionExt> {
    target: &'a mut T,
    conn: &'a mut C,
    trace_flags: TraceFlags,
    kill_behaviour: KillBehaviour,
    kill_core_on_exit: bool,
    timeout: Option<Duration>,
    packet_capacity: Option<usize>,
}

impl<'a, T: Target, C: ConnectionExt> GdbServerBuilder<'a, T, C> {
    pub fn new(target: &'a mut T, conn: &'a mut C) -> GdbServerBuilder<'a, T, C> {
        GdbServerBuilder {
            target,
            conn,
            trace_flags: TraceFlags::default(),
            kill_behaviour: KillBehaviour::ResetOnKill,
            kill_core_on_exit: false,
            timeout: None,
            packet_capacity: None,
        }
    }

    pub fn trace_flags(mut self, flags: TraceFlags) -> Self {
        self.trace_flags = flags;
        self
    }

    pub fn kill_behaviour(mut self, behaviour: KillBehaviour) -> Self {
        self.kill_behaviour = behaviour;
        self
    }

    /// Mark cores not-live when they perform an exit syscall.
    ///
    /// Off by default: a core that stays live looks (to GDB) like a fresh
    /// inferior immediately replacing the exited one, which is the nicer
    /// debugging experience.
    pub fn kill_core_on_exit(mut self, kill: bool) -> Self {
        self.kill_core_on_exit = kill;
        self
    }

    /// Wall-clock limit for a single continue; `None` disables.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a packet buffer of `capacity` bytes (advertised via
    /// `qSupported:PacketSize=`).
    pub fn packet_buffer_capacity(mut self, capacity: usize) -> Self {
        self.packet_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<GdbServer<'a, T, C>, GdbServerBuilderError> {
        let regbytes = self.target.reg_count() * self.target.reg_size();
        let minimum = (2 * regbytes + 1).max(256);

        let capacity = match self.packet_capacity {
            Some(requested) if requested < minimum => {
                return Err(GdbServerBuilderError::PacketBufTooSmall { requested, minimum })
            }
            Some(requested) => requested,
            None => DEFAULT_PACKET_CAPACITY.max(minimum),
        };

        let cores = CoreManager::new(self.target.cpu_count());

        Ok(GdbServer {
            target: self.target,
            conn: self.conn,
            pkt: PacketBuf::with_capacity(capacity),
            out: PacketBuf::with_capacity(capacity),
            recv: RecvPacketBlocking::new(),
            inner: GdbServerImpl {
                cores,
                matchpoints: MpTable::new(),
                trace: self.trace_flags,
                kill_behaviour: self.kill_behaviour,
                kill_core_on_exit: self.kill_core_on_exit,
                timeout: self.timeout,
                stop_mode: StopMode::AllStop,
                features: ProtocolFeatures::empty(),
                current_ptid: (PID_DEFAULT, TID_DEFAULT),
                resume_scope: IdKind::All,
                next_process: 0,
                syscall_core: None,
                exit_reason: None,
                packet_capacity: capacity,
            },
        })
    }
}
