use std::time::Instant;

use log::{debug, info, warn};

use super::prelude::*;
use super::syscall::SyscallOutcome;
use super::{DisconnectReason, StopMode, RUN_SAMPLE_PERIOD, TID_DEFAULT};
use crate::common::{Signal, Tid};
use crate::conn::ConnectionExt;
use crate::protocol::hex::decode_hex;
use crate::protocol::ptid::{IdKind, Ptid};
use crate::protocol::{split1, PacketBuf, ResponseWriterError};
use crate::stub::core_manager::CoreManager;
use crate::target::{ResetKind, ResumeKind, ResumeRes, TargetError};

/// Why the run loop handed control back to the packet pump.
pub(crate) enum RunOutcome {
    /// At least one core has stopped (or nothing is running).
    Stopped,
    /// A File-I/O request went out; execution resumes on the `F` reply.
    SyscallPending,
}

impl GdbServerImpl {
    pub(crate) fn handle_resume<T: Target, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        match body[0] {
            b'v' => self.handle_v_packet(res, target, body),

            // legacy continue/step, mapped onto the vCont machinery
            b'c' | b'C' | b's' | b'S' => {
                if body.len() > 1 {
                    warn!("resume address/signal in {:?} ignored", body[0] as char);
                }
                let kind = match body[0] {
                    b'c' | b'C' => ResumeKind::Continue,
                    _ => ResumeKind::Step,
                };
                if self.apply_resume_scope(kind) == 0 {
                    return Err(Error::NonFatal(0x22));
                }
                self.pre_resume_ack(res)?;
                Ok(HandlerStatus::Resume)
            }

            other => {
                warn!("command {:?} routed to resume handler", other as char);
                Ok(HandlerStatus::Handled)
            }
        }
    }

    fn handle_v_packet<T: Target, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let pkt: &[u8] = body;

        if pkt == b"vCont?" {
            res.write_str("vCont;c;C;s;S;t")?;
            return Ok(HandlerStatus::Handled);
        }
        if let Some(actions) = pkt.strip_prefix(b"vCont") {
            return self.handle_vcont(res, actions);
        }
        if pkt == b"vMustReplyEmpty" {
            return Ok(HandlerStatus::Handled);
        }
        if let Some(pid) = pkt.strip_prefix(b"vAttach;") {
            let pid: usize = decode_hex(pid).map_err(|_| Error::NonFatal(1))?;
            let id = Tid::new(pid).ok_or(Error::NonFatal(1)).map(IdKind::WithId)?;
            let core = self.core_for_id(id).map_err(|_| Error::NonFatal(1))?;
            self.current_ptid = (CoreManager::core2pid(core), TID_DEFAULT);
            self.write_stop_reply(res, core, Signal::SIGTRAP, false)?;
            return Ok(HandlerStatus::Handled);
        }
        if let Some(pid) = pkt.strip_prefix(b"vKill;") {
            let pid: usize = decode_hex(pid).map_err(|_| Error::NonFatal(1))?;
            let id = Tid::new(pid).ok_or(Error::NonFatal(1)).map(IdKind::WithId)?;
            let core = self.core_for_id(id).map_err(|_| Error::NonFatal(1))?;
            if !self.cores.kill_core(core) {
                warn!("vKill of already-dead core {}", core);
            }
            if self.cores.live_count() == 0 {
                self.exit_reason = Some(DisconnectReason::Kill);
            }
            return Ok(HandlerStatus::NeedsOk);
        }
        if pkt.starts_with(b"vRun") {
            // restart into the stopped-at-entry state
            target.reset(ResetKind::Cold).handle_error()?;
            self.cores.reset();
            self.matchpoints.clear_all();
            self.current_ptid = (super::PID_DEFAULT, TID_DEFAULT);
            self.write_stop_reply(res, 0, Signal::SIGTRAP, false)?;
            return Ok(HandlerStatus::Handled);
        }

        info!(
            "unsupported v packet: {:?}",
            core::str::from_utf8(body).unwrap_or("<binary>")
        );
        Ok(HandlerStatus::Handled)
    }

    /// `vCont[;action[:ptid]]...` — the first action matching a core wins.
    fn handle_vcont<T, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        actions: &[u8],
    ) -> Result<HandlerStatus, Error<T, C::Error>> {
        let count = self.cores.cpu_count();
        let mut assigned = vec![false; count];
        let mut matched = 0usize;

        for action in actions.split(|b| *b == b';') {
            if action.is_empty() {
                continue;
            }
            let (act, ptid) = match split1(action, b':') {
                Some((act, ptid)) => {
                    let ptid = Ptid::parse(ptid).ok_or(Error::NonFatal(1))?;
                    (act, Some(ptid))
                }
                None => (action, None),
            };

            // C/S carry a signal value; this target has nowhere to deliver
            // it, so they degrade to plain continue/step
            let kind = match act.first().copied() {
                Some(b'c') | Some(b'C') => Some(ResumeKind::Continue),
                Some(b's') | Some(b'S') => Some(ResumeKind::Step),
                Some(b't') => None,
                _ => return Err(Error::NonFatal(1)),
            };

            for core in 0..count {
                if assigned[core]
                    || !self.cores[core].is_live()
                    || !Self::ptid_selects(ptid, core)
                {
                    continue;
                }
                assigned[core] = true;
                matched += 1;
                match kind {
                    Some(kind) => self.cores[core].set_resume(Some(kind)),
                    None => {
                        // 't': hold the core stopped and owe the client an
                        // INT stop event
                        self.cores[core].set_resume(None);
                        self.cores[core].set_stop_reason(ResumeRes::Interrupted);
                    }
                }
            }
        }

        if matched == 0 {
            return Err(Error::NonFatal(0x22));
        }
        self.pre_resume_ack(res)?;
        Ok(HandlerStatus::Resume)
    }

    fn ptid_selects(ptid: Option<Ptid>, core: usize) -> bool {
        let ptid = match ptid {
            // an action with no ptid applies to every core
            None => return true,
            Some(ptid) => ptid,
        };
        match ptid.pid.unwrap_or(ptid.tid) {
            IdKind::All | IdKind::Any => true,
            IdKind::WithId(id) => id.get() == core + 1,
        }
    }

    /// Apply a legacy `c`/`s` to the `Hc`-selected scope.
    fn apply_resume_scope(&mut self, kind: ResumeKind) -> usize {
        let mut matched = 0;
        for core in 0..self.cores.cpu_count() {
            if !self.cores[core].is_live() {
                continue;
            }
            let selected = match self.resume_scope {
                IdKind::All | IdKind::Any => true,
                IdKind::WithId(id) => id.get() == core + 1,
            };
            if selected {
                self.cores[core].set_resume(Some(kind));
                matched += 1;
            }
        }
        matched
    }

    /// In non-stop mode a resume command is acknowledged immediately; the
    /// stop events follow as notifications.
    fn pre_resume_ack<C: ConnectionExt>(
        &self,
        res: &mut ResponseWriter<'_, C>,
    ) -> Result<(), ResponseWriterError<C::Error>> {
        if self.stop_mode == StopMode::NonStop {
            res.write_str("OK")?;
            res.flush_now()?;
        }
        Ok(())
    }

    pub(crate) fn resume_and_report<T: Target, C: ConnectionExt>(
        &mut self,
        target: &mut T,
        conn: &mut C,
        out: &mut PacketBuf,
    ) -> Result<Option<DisconnectReason>, Error<T::Error, C::Error>> {
        match self.wait_for_stop(target, conn, out)? {
            RunOutcome::SyscallPending => Ok(None),
            RunOutcome::Stopped => self.report_stop_events(conn, out),
        }
    }

    /// Drive every resumed core in instruction slices, polling the transport
    /// for a `0x03` between slices, until a stop event must be delivered.
    fn wait_for_stop<T: Target, C: ConnectionExt>(
        &mut self,
        target: &mut T,
        conn: &mut C,
        out: &mut PacketBuf,
    ) -> Result<RunOutcome, Error<T::Error, C::Error>> {
        let started = Instant::now();

        loop {
            for core in 0..self.cores.cpu_count() {
                if !self.cores[core].is_live() {
                    continue;
                }
                let kind = match self.cores[core].resume_kind() {
                    Some(kind) => kind,
                    None => continue,
                };

                if self.trace.exec {
                    debug!("core {}: {:?} slice", core, kind);
                }
                let outcome = match target.resume(core, kind, RUN_SAMPLE_PERIOD) {
                    Ok(res) => res,
                    Err(TargetError::Fatal(e)) => return Err(Error::TargetError(e)),
                    Err(_) => {
                        warn!("target refused to resume core {}", core);
                        ResumeRes::Failed
                    }
                };

                match outcome {
                    ResumeRes::None => {}
                    ResumeRes::Syscall => {
                        if let SyscallOutcome::Forwarded =
                            self.start_syscall(target, conn, out, core)?
                        {
                            return Ok(RunOutcome::SyscallPending);
                        }
                    }
                    stop => {
                        if self.trace.exec {
                            debug!("core {} stopped: {:?}", core, stop);
                        }
                        self.cores[core].set_resume(None);
                        self.cores[core].set_stop_reason(stop);
                    }
                }
            }

            // a ^C from the host trumps everything still running
            if self.poll_interrupt(conn)? {
                self.halt_running(target, Some(ResumeRes::Interrupted))?;
            }

            // wall-clock timeout synthesizes an XCPU stop
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit && self.any_running() {
                    warn!("continue timed out after {:?}", limit);
                    self.halt_running(target, Some(ResumeRes::Timeout))?;
                }
            }

            let any_unreported = (0..self.cores.cpu_count())
                .any(|core| self.cores[core].has_unreported_stop());

            if !self.any_running() {
                break;
            }
            if self.stop_mode == StopMode::AllStop && any_unreported {
                // all-stop means exactly that: quietly halt the remaining
                // runners before reporting
                self.halt_running(target, None)?;
                break;
            }
            if self.exit_reason.is_some() {
                break;
            }
        }

        Ok(RunOutcome::Stopped)
    }

    fn any_running(&self) -> bool {
        self.cores.iter().any(|c| c.is_live() && c.is_running())
    }

    /// Halt every running core; `reason` records a reportable stop event,
    /// `None` halts silently.
    fn halt_running<T: Target, C>(
        &mut self,
        target: &mut T,
        reason: Option<ResumeRes>,
    ) -> Result<(), Error<T::Error, C>> {
        match target.halt_all() {
            Ok(()) => {}
            Err(TargetError::Fatal(e)) => return Err(Error::TargetError(e)),
            Err(_) => warn!("target failed to halt cleanly"),
        }
        for core in 0..self.cores.cpu_count() {
            if self.cores[core].is_live() && self.cores[core].is_running() {
                self.cores[core].set_resume(None);
                if let Some(reason) = reason {
                    self.cores[core].set_stop_reason(reason);
                }
            }
        }
        Ok(())
    }

    fn poll_interrupt<T, C: ConnectionExt>(
        &self,
        conn: &mut C,
    ) -> Result<bool, Error<T, C::Error>> {
        match conn.peek().map_err(Error::ConnectionRead)? {
            Some(0x03) => {
                let _ = conn.read().map_err(Error::ConnectionRead)?;
                info!("host interrupt (^C) while target running");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Deliver pending stop events: one synchronous `T`/`W` reply in
    /// all-stop, a `%Stop` notification per event in non-stop.
    fn report_stop_events<T, C: ConnectionExt>(
        &mut self,
        conn: &mut C,
        out: &mut PacketBuf,
    ) -> Result<Option<DisconnectReason>, Error<T, C::Error>> {
        let count = self.cores.cpu_count();

        match self.stop_mode {
            StopMode::AllStop => {
                let core = match (0..count).find(|&c| self.cores[c].has_unreported_stop()) {
                    Some(core) => core,
                    None => {
                        // can only happen if the session is shutting down
                        // mid-resume (e.g. vKill of the last core)
                        warn!("resume finished with no stop event to report");
                        let mut res = ResponseWriter::new(conn, out, self.trace.rsp);
                        res.write_str("E01")?;
                        res.flush()?;
                        return Ok(None);
                    }
                };

                self.cores[core].mark_stop_reported();
                self.current_ptid = (CoreManager::core2pid(core), TID_DEFAULT);

                let reason = self.cores[core].stop_reason();
                let mut res = ResponseWriter::new(conn, out, self.trace.rsp);
                if let ResumeRes::Exited(code) = reason {
                    self.write_exit_reply(&mut res, core, code)?;
                    res.flush()?;
                    if self.cores.live_count() == 0 {
                        return Ok(Some(DisconnectReason::TargetExited(code)));
                    }
                } else {
                    let (sig, swbreak) = signal_for(reason);
                    self.write_stop_reply(&mut res, core, sig, swbreak)?;
                    res.flush()?;
                }
                Ok(None)
            }
            StopMode::NonStop => {
                let mut last_exit = None;
                for core in 0..count {
                    if !self.cores[core].has_unreported_stop() {
                        continue;
                    }
                    self.cores[core].mark_stop_reported();
                    self.current_ptid = (CoreManager::core2pid(core), TID_DEFAULT);

                    let reason = self.cores[core].stop_reason();
                    let mut res = ResponseWriter::new(conn, out, self.trace.rsp);
                    res.write_str("Stop:")?;
                    if let ResumeRes::Exited(code) = reason {
                        self.write_exit_reply(&mut res, core, code)?;
                        last_exit = Some(code);
                    } else {
                        let (sig, swbreak) = signal_for(reason);
                        self.write_stop_reply(&mut res, core, sig, swbreak)?;
                    }
                    res.flush_notification()?;
                }
                if self.cores.live_count() == 0 {
                    if let Some(code) = last_exit {
                        return Ok(Some(DisconnectReason::TargetExited(code)));
                    }
                }
                Ok(None)
            }
        }
    }

    /// `T<sig>thread:<ptid>;core:<n>;[swbreak:;]`
    pub(crate) fn write_stop_reply<C: ConnectionExt>(
        &self,
        res: &mut ResponseWriter<'_, C>,
        core: usize,
        sig: Signal,
        swbreak: bool,
    ) -> Result<(), ResponseWriterError<C::Error>> {
        res.write(b'T')?;
        res.write_hex(sig.0)?;
        res.write_str("thread:")?;
        self.reply_ptid(res, core)?;
        res.write(b';')?;
        res.write_str("core:")?;
        res.write_dec(core as u64)?;
        res.write(b';')?;
        if swbreak {
            res.write_str("swbreak:;")?;
        }
        Ok(())
    }

    /// `W<code>[;process:<pid>]`
    pub(crate) fn write_exit_reply<C: ConnectionExt>(
        &self,
        res: &mut ResponseWriter<'_, C>,
        core: usize,
        code: u8,
    ) -> Result<(), ResponseWriterError<C::Error>> {
        res.write(b'W')?;
        res.write_hex(code)?;
        if self.multiprocess() {
            res.write_str(";process:")?;
            res.write_id(CoreManager::core2pid(core).get() as u64)?;
        }
        Ok(())
    }

    /// Render a core's identity the way the client addresses it: a
    /// `p<pid>.1` pair under multiprocess, a bare core-numbered TID
    /// otherwise.
    pub(crate) fn reply_ptid<C: ConnectionExt>(
        &self,
        res: &mut ResponseWriter<'_, C>,
        core: usize,
    ) -> Result<(), ResponseWriterError<C::Error>> {
        if self.multiprocess() {
            res.write_ptid(Some(CoreManager::core2pid(core)), TID_DEFAULT)
        } else {
            res.write_ptid(None, CoreManager::core2pid(core))
        }
    }
}

fn signal_for(reason: ResumeRes) -> (Signal, bool) {
    match reason {
        ResumeRes::Interrupted => (Signal::SIGINT, false),
        ResumeRes::Break => (Signal::SIGTRAP, true),
        ResumeRes::Stepped => (Signal::SIGTRAP, false),
        ResumeRes::Timeout => (Signal::SIGXCPU, false),
        _ => (Signal::UNKNOWN, false),
    }
}
