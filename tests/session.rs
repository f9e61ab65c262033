//! End-to-end sessions: scripted client byte streams driven through a
//! [`GdbServer`] against a mock CPU, asserting on the decoded reply frames.

use std::collections::{HashMap, VecDeque};

use rvstub::{
    Connection, ConnectionExt, DisconnectReason, GdbServer, ResetKind, ResumeKind, ResumeRes,
    SyscallArgs, Target, TargetResult,
};

// ------------------------------------------------------------------------
// Loopback transport
// ------------------------------------------------------------------------

#[derive(Debug)]
struct Eof;

impl std::fmt::Display for Eof {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "end of scripted input")
    }
}

struct PipeConn {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl PipeConn {
    fn new(input: Vec<u8>) -> PipeConn {
        PipeConn {
            input: input.into(),
            output: Vec::new(),
        }
    }
}

impl Connection for PipeConn {
    type Error = Eof;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Eof> {
        self.output.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Eof> {
        Ok(())
    }
}

impl ConnectionExt for PipeConn {
    fn read(&mut self) -> Result<u8, Eof> {
        self.input.pop_front().ok_or(Eof)
    }

    fn peek(&mut self) -> Result<Option<u8>, Eof> {
        Ok(self.input.front().copied())
    }
}

// ------------------------------------------------------------------------
// Mock CPU
// ------------------------------------------------------------------------

const NUM_REGS: usize = 33;

struct TestCpu {
    regs: Vec<[u32; NUM_REGS]>,
    mem: HashMap<u32, u8>,
    /// Scripted outcome of each `resume` call, per core. An empty queue
    /// means "budget elapsed, still running".
    run_script: Vec<VecDeque<ResumeRes>>,
    syscalls: HashMap<usize, SyscallArgs>,
    syscall_results: Vec<(usize, i64, u32)>,
    resets: usize,
    halts: usize,
}

impl TestCpu {
    fn new(cores: usize) -> TestCpu {
        TestCpu {
            regs: vec![[0; NUM_REGS]; cores],
            mem: HashMap::new(),
            run_script: vec![VecDeque::new(); cores],
            syscalls: HashMap::new(),
            syscall_results: Vec::new(),
            resets: 0,
            halts: 0,
        }
    }

    fn poke(&mut self, addr: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.mem.insert(addr + i as u32, *b);
        }
    }

    fn peek_mem(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| *self.mem.get(&(addr + i as u32)).unwrap_or(&0))
            .collect()
    }

    fn script(&mut self, core: usize, outcomes: &[ResumeRes]) {
        self.run_script[core].extend(outcomes.iter().copied());
    }
}

impl Target for TestCpu {
    type Error = String;

    fn cpu_count(&self) -> usize {
        self.regs.len()
    }

    fn reg_count(&self) -> usize {
        NUM_REGS
    }

    fn reg_size(&self) -> usize {
        4
    }

    fn read_register(&mut self, core: usize, reg: usize) -> TargetResult<u32, Self> {
        self.regs[core].get(reg).copied().ok_or(().into())
    }

    fn write_register(&mut self, core: usize, reg: usize, val: u32) -> TargetResult<(), Self> {
        *self.regs[core].get_mut(reg).ok_or(())? = val;
        Ok(())
    }

    fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> TargetResult<(), Self> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *self.mem.get(&(addr.wrapping_add(i as u32))).unwrap_or(&0);
        }
        Ok(())
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> TargetResult<usize, Self> {
        for (i, b) in data.iter().enumerate() {
            self.mem.insert(addr.wrapping_add(i as u32), *b);
        }
        Ok(data.len())
    }

    fn resume(
        &mut self,
        core: usize,
        _kind: ResumeKind,
        _instr_budget: u64,
    ) -> TargetResult<ResumeRes, Self> {
        Ok(self.run_script[core].pop_front().unwrap_or(ResumeRes::None))
    }

    fn halt_all(&mut self) -> TargetResult<(), Self> {
        self.halts += 1;
        Ok(())
    }

    fn reset(&mut self, _kind: ResetKind) -> TargetResult<(), Self> {
        self.resets += 1;
        for regs in &mut self.regs {
            *regs = [0; NUM_REGS];
        }
        Ok(())
    }

    fn syscall_args(&mut self, core: usize) -> TargetResult<SyscallArgs, Self> {
        self.syscalls.get(&core).copied().ok_or(().into())
    }

    fn syscall_result(&mut self, core: usize, ret: i64, errno: u32) -> TargetResult<(), Self> {
        self.syscall_results.push((core, ret, errno));
        Ok(())
    }

    fn cycle_count(&mut self) -> u64 {
        123_456
    }

    fn instr_count(&mut self) -> u64 {
        654_321
    }
}

// ------------------------------------------------------------------------
// Session plumbing
// ------------------------------------------------------------------------

fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |a, b| a.wrapping_add(*b))
}

/// Builds the client's byte stream. Each command is followed by the `+`
/// that acknowledges the server's reply to it.
struct Script {
    bytes: Vec<u8>,
}

impl Script {
    fn new() -> Script {
        Script { bytes: Vec::new() }
    }

    /// A framed command with no ack appended (for replies that arrive after
    /// other input, or packets that get no reply at all).
    fn cmd_noack(mut self, body: &[u8]) -> Script {
        self.bytes.push(b'$');
        self.bytes.extend_from_slice(body);
        self.bytes.push(b'#');
        self.bytes
            .extend_from_slice(format!("{:02x}", checksum(body)).as_bytes());
        self
    }

    /// A framed command plus the ack for its reply.
    fn cmd(self, body: &[u8]) -> Script {
        self.cmd_noack(body).raw(b"+")
    }

    /// Raw bytes, exactly as given (interrupts, stray acks).
    fn raw(mut self, bytes: &[u8]) -> Script {
        self.bytes.extend_from_slice(bytes);
        self
    }

    fn detach(self) -> Vec<u8> {
        self.cmd(b"D").bytes
    }
}

/// One decoded server frame: the lead byte (`$` or `%`) and the payload.
#[derive(Debug, PartialEq)]
struct Frame {
    lead: u8,
    payload: Vec<u8>,
}

impl Frame {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Parse the server's output stream, verifying every frame checksum.
fn parse_frames(out: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i < out.len() {
        match out[i] {
            lead @ (b'$' | b'%') => {
                let start = i + 1;
                let hash = start + out[start..].iter().position(|b| *b == b'#').unwrap();
                let payload = out[start..hash].to_vec();
                let claimed = std::str::from_utf8(&out[hash + 1..hash + 3]).unwrap();
                assert_eq!(
                    u8::from_str_radix(claimed, 16).unwrap(),
                    checksum(&payload),
                    "bad checksum on outbound frame {:?}",
                    String::from_utf8_lossy(&payload)
                );
                frames.push(Frame { lead, payload });
                i = hash + 3;
            }
            _ => i += 1,
        }
    }
    frames
}

fn run_session(cpu: &mut TestCpu, input: Vec<u8>) -> (DisconnectReason, Vec<Frame>) {
    run_session_with(cpu, input, false)
}

fn run_session_with(
    cpu: &mut TestCpu,
    input: Vec<u8>,
    kill_core_on_exit: bool,
) -> (DisconnectReason, Vec<Frame>) {
    let mut conn = PipeConn::new(input);
    let reason = {
        let mut server = GdbServer::builder(cpu, &mut conn)
            .kill_core_on_exit(kill_core_on_exit)
            .build()
            .unwrap();
        server.run().unwrap()
    };
    (reason, parse_frames(&conn.output))
}

fn payloads(frames: &[Frame]) -> Vec<String> {
    frames.iter().map(Frame::text).collect()
}

fn hex(text: &str) -> Vec<u8> {
    text.bytes().flat_map(|b| format!("{:02x}", b).into_bytes()).collect()
}

// ------------------------------------------------------------------------
// Scenarios
// ------------------------------------------------------------------------

#[test]
fn handshake_and_register_read() {
    let mut cpu = TestCpu::new(2);
    let input = Script::new()
        .cmd(b"qSupported:multiprocess+;swbreak+")
        .cmd(b"?")
        .cmd(b"g")
        .detach();

    let (reason, frames) = run_session(&mut cpu, input);
    assert_eq!(reason, DisconnectReason::Disconnect);

    let replies = payloads(&frames);
    assert_eq!(
        replies[0],
        "PacketSize=400;qXfer:features:read+;multiprocess+;swbreak+;vContSupported+;QNonStop+"
    );
    assert_eq!(replies[1], "T05thread:p01.01;core:0;");
    assert_eq!(replies[2], "0".repeat(NUM_REGS * 8));
    assert_eq!(replies[3], "OK"); // detach
}

#[test]
fn software_breakpoint_insert_remove_is_idempotent() {
    let mut cpu = TestCpu::new(1);
    cpu.poke(0x1000, &[0xde, 0xad, 0xbe, 0xef]);

    let input = Script::new()
        .cmd(b"Z0,1000,4")
        .cmd(b"m1000,4")
        .cmd(b"z0,1000,4")
        .cmd(b"m1000,4")
        .cmd(b"z0,1000,4")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "OK");
    // EBREAK, little-endian, sits in memory while the breakpoint is armed
    assert_eq!(replies[1], "73001000");
    assert_eq!(replies[2], "OK");
    assert_eq!(replies[3], "deadbeef");
    // removing an absent matchpoint is a successful no-op
    assert_eq!(replies[4], "OK");
    assert_eq!(cpu.peek_mem(0x1000, 4), vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn continue_interrupted_by_host_break() {
    let mut cpu = TestCpu::new(1);
    // the core never stops on its own; the 0x03 does it. The ack after the
    // interrupt is for the stop reply.
    let input = Script::new()
        .cmd(b"qSupported:multiprocess+")
        .cmd_noack(b"vCont;c")
        .raw(&[0x03, b'+'])
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[1], "T02thread:p01.01;core:0;");
    assert_eq!(cpu.halts, 1);
}

#[test]
fn memory_write_then_read() {
    let mut cpu = TestCpu::new(1);
    let input = Script::new()
        .cmd(b"M2000,4:deadbeef")
        .cmd(b"m2000,4")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "OK");
    assert_eq!(replies[1], "deadbeef");
}

#[test]
fn binary_write_with_escaped_payload() {
    let mut cpu = TestCpu::new(1);
    // "}\x03" and "}\x04" decode to 0x23 0x24
    let input = Script::new()
        .cmd(b"X2000,2:}\x03}\x04")
        .cmd(b"m2000,2")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "OK");
    assert_eq!(replies[1], "2324");
    assert_eq!(cpu.peek_mem(0x2000, 2), vec![0x23, 0x24]);
}

#[test]
fn exit_syscall_kills_core_and_reports_remaining_threads() {
    let mut cpu = TestCpu::new(2);
    cpu.script(0, &[ResumeRes::Syscall]);
    cpu.syscalls.insert(
        0,
        SyscallArgs {
            num: 93, // exit
            args: [7, 0, 0, 0],
        },
    );

    let input = Script::new()
        .cmd(b"qSupported:multiprocess+")
        .cmd(b"vCont;c")
        .cmd(b"qfThreadInfo")
        .cmd(b"qsThreadInfo")
        .detach();

    let (reason, frames) = run_session_with(&mut cpu, input, true);
    assert_eq!(reason, DisconnectReason::Disconnect);

    let replies = payloads(&frames);
    assert_eq!(replies[1], "W07;process:01");
    assert_eq!(replies[2], "mp02.01");
    assert_eq!(replies[3], "l");
}

#[test]
fn exit_of_last_core_ends_the_session() {
    let mut cpu = TestCpu::new(1);
    cpu.script(0, &[ResumeRes::Syscall]);
    cpu.syscalls.insert(
        0,
        SyscallArgs {
            num: 93,
            args: [3, 0, 0, 0],
        },
    );

    let input = Script::new().cmd(b"vCont;c").bytes;
    let (reason, frames) = run_session_with(&mut cpu, input, true);
    assert_eq!(reason, DisconnectReason::TargetExited(3));
    assert_eq!(payloads(&frames)[0], "W03");
}

#[test]
fn breakpoint_hit_reports_swbreak() {
    let mut cpu = TestCpu::new(2);
    cpu.script(1, &[ResumeRes::Break]);
    cpu.script(0, &[ResumeRes::None, ResumeRes::None]);

    let input = Script::new()
        .cmd(b"qSupported:multiprocess+")
        .cmd(b"vCont;c")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[1], "T05thread:p02.01;core:1;swbreak:;");
}

#[test]
fn single_step_reports_trap() {
    let mut cpu = TestCpu::new(2);
    cpu.script(0, &[ResumeRes::Stepped]);

    let input = Script::new()
        .cmd(b"qSupported:multiprocess+")
        .cmd(b"vCont;s:p1.1")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    assert_eq!(payloads(&frames)[1], "T05thread:p01.01;core:0;");
}

#[test]
fn vcont_with_no_matching_thread_is_e22() {
    let mut cpu = TestCpu::new(2);
    let input = Script::new().cmd(b"vCont;c:p5.1").detach();

    let (_, frames) = run_session(&mut cpu, input);
    assert_eq!(payloads(&frames)[0], "E22");
}

#[test]
fn register_write_round_trips() {
    let mut cpu = TestCpu::new(1);
    let input = Script::new()
        .cmd(b"P2=efbeadde")
        .cmd(b"p2")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "OK");
    assert_eq!(replies[1], "efbeadde");
    // wire order is little-endian: the register holds 0xdeadbeef
    assert_eq!(cpu.regs[0][2], 0xdead_beef);
}

#[test]
fn file_io_round_trip_resumes_the_core() {
    let mut cpu = TestCpu::new(1);
    cpu.script(0, &[ResumeRes::Syscall, ResumeRes::Break]);
    cpu.syscalls.insert(
        0,
        SyscallArgs {
            num: 64, // write
            args: [1, 0x3000, 5, 0],
        },
    );

    let input = Script::new()
        .cmd(b"vCont;c") // ack consumed by the F request
        .cmd(b"F5") // host wrote all five bytes; ack consumed by T05
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "Fwrite,1,3000,5");
    assert_eq!(replies[1], "T05thread:01;core:0;swbreak:;");
    assert_eq!(cpu.syscall_results, vec![(0, 5, 0)]);
}

#[test]
fn interrupted_file_io_reports_int_stop() {
    let mut cpu = TestCpu::new(1);
    cpu.script(0, &[ResumeRes::Syscall]);
    cpu.syscalls.insert(
        0,
        SyscallArgs {
            num: 63, // read
            args: [0, 0x3000, 16, 0],
        },
    );

    let input = Script::new()
        .cmd(b"vCont;c")
        .cmd(b"F-1,4,C") // EINTR + ctrl-c flag
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "Fread,0,3000,10");
    assert_eq!(replies[1], "T02thread:01;core:0;");
    assert_eq!(cpu.syscall_results, vec![(0, -1, 4)]);
}

#[test]
fn nonstop_mode_delivers_stop_notifications() {
    let mut cpu = TestCpu::new(1);
    cpu.script(0, &[ResumeRes::Break]);

    let input = Script::new()
        .cmd(b"QNonStop:1")
        .cmd(b"vCont;c") // ack is for the immediate OK
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    assert_eq!(frames[0].text(), "OK"); // QNonStop
    assert_eq!(frames[1].text(), "OK"); // vCont acked up front
    assert_eq!(frames[2].lead, b'%');
    assert_eq!(frames[2].text(), "Stop:T05thread:01;core:0;swbreak:;");
}

#[test]
fn monitor_set_show_round_trip() {
    let mut cpu = TestCpu::new(1);

    let mut set = b"qRcmd,".to_vec();
    set.extend_from_slice(&hex("set exec on"));
    let mut show = b"qRcmd,".to_vec();
    show.extend_from_slice(&hex("show exec"));

    // `show` emits an O packet and then OK: two packets, two acks
    let input = Script::new().cmd(&set).cmd(&show).raw(b"+").detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "OK");
    // show: one O-packet of hex-encoded text, then OK
    let expected = String::from_utf8(hex("exec: on\n")).unwrap();
    assert_eq!(replies[1], format!("O{}", expected));
    assert_eq!(replies[2], "OK");
}

#[test]
fn monitor_counters_report_values() {
    let mut cpu = TestCpu::new(1);
    let mut cmd = b"qRcmd,".to_vec();
    cmd.extend_from_slice(&hex("cyclecount"));

    // the counter text goes out as an O packet ahead of the OK
    let input = Script::new().cmd(&cmd).raw(b"+").detach();
    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], format!("O{}", String::from_utf8(hex("123456\n")).unwrap()));
    assert_eq!(replies[1], "OK");
}

#[test]
fn target_xml_is_served_in_windows() {
    let mut cpu = TestCpu::new(1);
    let input = Script::new()
        .cmd(b"qXfer:features:read:target.xml:0,ffb")
        .cmd(b"qXfer:features:read:target.xml:ffff,ffb")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert!(replies[0].starts_with("m<?xml"));
    assert!(replies[0].contains("riscv:rv32"));
    assert_eq!(replies[1], "l");
}

#[test]
fn bad_checksum_is_nakd_and_recovered() {
    let mut cpu = TestCpu::new(1);
    let input = Script::new()
        .raw(b"$m1000,4#00") // wrong checksum: no reply, just a NAK
        .detach();

    let mut conn = PipeConn::new(input);
    {
        let mut server = GdbServer::builder(&mut cpu, &mut conn).build().unwrap();
        server.run().unwrap();
    }
    assert!(conn.output.starts_with(b"-"));
    let frames = parse_frames(&conn.output);
    assert_eq!(frames[0].text(), "OK"); // the detach still works
}

#[test]
fn unknown_commands_get_the_empty_reply() {
    let mut cpu = TestCpu::new(1);
    let input = Script::new()
        .cmd(b"vMustReplyEmpty")
        .cmd(b"qBogusQuery")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[0], "");
    assert_eq!(replies[1], "");
}

#[test]
fn restart_revives_cores_and_clears_matchpoints() {
    let mut cpu = TestCpu::new(2);
    cpu.poke(0x1000, &[0x11, 0x22, 0x33, 0x44]);
    cpu.script(0, &[ResumeRes::Syscall]);
    cpu.syscalls.insert(
        0,
        SyscallArgs {
            num: 93,
            args: [0, 0, 0, 0],
        },
    );

    let input = Script::new()
        .cmd(b"qSupported:multiprocess+")
        .cmd(b"Z0,1000,4")
        .cmd(b"vCont;c:p1.1") // core 0 exits
        .raw(b"$R00#b2") // restart: no reply
        .cmd(b"qfThreadInfo")
        .detach();

    let (_, frames) = run_session_with(&mut cpu, input, true);
    let replies = payloads(&frames);
    assert_eq!(replies[1], "OK"); // Z
    assert_eq!(replies[2], "W00;process:01");
    // after restart both cores are live again
    assert_eq!(replies[3], "mp01.01");
    assert!(cpu.resets >= 1);
}

#[test]
fn thread_alive_query_tracks_core_liveness() {
    let mut cpu = TestCpu::new(2);
    let input = Script::new()
        .cmd(b"qSupported:multiprocess+")
        .cmd(b"vKill;2")
        .cmd(b"Tp2.1")
        .cmd(b"Tp1.1")
        .detach();

    let (_, frames) = run_session(&mut cpu, input);
    let replies = payloads(&frames);
    assert_eq!(replies[1], "OK"); // vKill
    assert_eq!(replies[2], "E01"); // core 1 is dead
    assert_eq!(replies[3], "OK"); // core 0 is alive
}
