//! A debug stub for simulated multi-core RV32 targets, speaking the GDB
//! Remote Serial Protocol (RSP) over a byte-stream transport.
//!
//! The server sits between a debugger and a CPU model: it frames and
//! checksums RSP packets, dispatches requests into register/memory/execution
//! operations on an attached [`Target`], and streams stop events back.
//! Cores are presented to the client as processes (`p<pid>.1` identifiers),
//! so a multiprocess-aware GDB can attach to, resume, and kill them
//! individually.
//!
//! ```no_run
//! use rvstub::{GdbServer, KillBehaviour, TraceFlags};
//! # fn debug(cpu: &mut impl rvstub::Target<Error = String>) -> Result<(), Box<dyn std::error::Error>> {
//! let listener = std::net::TcpListener::bind("127.0.0.1:3333")?;
//! let (mut stream, _) = listener.accept()?;
//!
//! let mut server = GdbServer::new(
//!     cpu,
//!     &mut stream,
//!     TraceFlags::default(),
//!     KillBehaviour::ResetOnKill,
//! );
//! let reason = server.run()?;
//! println!("session ended: {:?}", reason);
//! # Ok(())
//! # }
//! ```
//!
//! The [`Target`] and [`Connection`](conn::Connection) seams are the only
//! integration points; everything else (packet codec, matchpoint registry,
//! core lifecycle, File-I/O forwarding) lives behind [`GdbServer::run`].

pub mod common;
pub mod conn;
pub mod matchpoint;
pub mod target;

mod protocol;
mod stub;

pub use common::{Signal, TraceFlags};
pub use conn::{Connection, ConnectionExt};
pub use matchpoint::{MatchKind, MpTable};
pub use stub::{
    DisconnectReason, Error, GdbServer, GdbServerBuilder, GdbServerBuilderError, KillBehaviour,
    StopMode,
};
pub use target::{
    ResetKind, ResumeKind, ResumeRes, SyscallArgs, Target, TargetError, TargetResult,
};
