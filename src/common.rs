//! Types shared between the protocol layer and the dispatcher.

use core::num::NonZeroUsize;

/// Process ID reported to the GDB client.
///
/// PIDs are 1-based: PID `n` is core `n - 1`. PID 1 / core 0 is the default
/// process a freshly-connected client debugs.
pub type Pid = NonZeroUsize;

/// Thread ID reported to the GDB client.
///
/// Each core runs exactly one thread, so every reported TID is 1.
pub type Tid = NonZeroUsize;

/// Signal numbers defined by the GDB Remote Serial Protocol.
///
/// Only the signals this server reports are named here; the authoritative
/// table is binutils-gdb's `include/gdb/signals.def`.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u8);

#[rustfmt::skip]
impl Signal {
    #[doc = "Interrupt"]                  pub const SIGINT:  Self = Self(2);
    #[doc = "Trace/breakpoint trap"]      pub const SIGTRAP: Self = Self(5);
    #[doc = "CPU time limit exceeded"]    pub const SIGXCPU: Self = Self(24);
    #[doc = "User defined signal 1"]      pub const SIGUSR1: Self = Self(30);
    #[doc = "Stop cause unknown to GDB"]  pub const UNKNOWN: Self = Self(143);
}

/// Runtime-adjustable diagnostics, toggled via `monitor set <flag> on|off`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceFlags {
    /// Echo every RSP packet in both directions.
    pub rsp: bool,
    /// Log each resume slice and collected stop event.
    pub exec: bool,
}

impl TraceFlags {
    pub fn set(&mut self, name: &str, on: bool) -> bool {
        match name {
            "rsp" => self.rsp = on,
            "exec" => self.exec = on,
            _ => return false,
        }
        true
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        match name {
            "rsp" => Some(self.rsp),
            "exec" => Some(self.exec),
            _ => None,
        }
    }
}
