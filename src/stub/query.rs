use log::info;

use super::prelude::*;
use super::{ProtocolFeatures, StopMode};
use crate::protocol::hex::decode_hex;
use crate::protocol::split1;

/// Static target description served via `qXfer:features:read`.
///
/// 32 general registers plus the PC, 4 bytes each; the wire encoding of
/// every register is little-endian.
const TARGET_XML: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
  <architecture>riscv:rv32</architecture>
  <feature name="org.gnu.gdb.riscv.cpu">
    <reg name="zero" bitsize="32" type="int"/>
    <reg name="ra" bitsize="32" type="code_ptr"/>
    <reg name="sp" bitsize="32" type="data_ptr"/>
    <reg name="gp" bitsize="32" type="data_ptr"/>
    <reg name="tp" bitsize="32" type="data_ptr"/>
    <reg name="t0" bitsize="32" type="int"/>
    <reg name="t1" bitsize="32" type="int"/>
    <reg name="t2" bitsize="32" type="int"/>
    <reg name="fp" bitsize="32" type="data_ptr"/>
    <reg name="s1" bitsize="32" type="int"/>
    <reg name="a0" bitsize="32" type="int"/>
    <reg name="a1" bitsize="32" type="int"/>
    <reg name="a2" bitsize="32" type="int"/>
    <reg name="a3" bitsize="32" type="int"/>
    <reg name="a4" bitsize="32" type="int"/>
    <reg name="a5" bitsize="32" type="int"/>
    <reg name="a6" bitsize="32" type="int"/>
    <reg name="a7" bitsize="32" type="int"/>
    <reg name="s2" bitsize="32" type="int"/>
    <reg name="s3" bitsize="32" type="int"/>
    <reg name="s4" bitsize="32" type="int"/>
    <reg name="s5" bitsize="32" type="int"/>
    <reg name="s6" bitsize="32" type="int"/>
    <reg name="s7" bitsize="32" type="int"/>
    <reg name="s8" bitsize="32" type="int"/>
    <reg name="s9" bitsize="32" type="int"/>
    <reg name="s10" bitsize="32" type="int"/>
    <reg name="s11" bitsize="32" type="int"/>
    <reg name="t3" bitsize="32" type="int"/>
    <reg name="t4" bitsize="32" type="int"/>
    <reg name="t5" bitsize="32" type="int"/>
    <reg name="t6" bitsize="32" type="int"/>
    <reg name="pc" bitsize="32" type="code_ptr"/>
  </feature>
</target>
"#;

impl GdbServerImpl {
    pub(crate) fn handle_query<T: Target, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        body: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let head: &[u8] = body;

        let handler_status = match () {
            _ if head.starts_with(b"qSupported") => {
                // incoming feature negotiation: all we care about is whether
                // the client speaks multiprocess
                if let Some((_, features)) = split1(head, b':') {
                    for feature in features.split(|b| *b == b';') {
                        if feature == b"multiprocess+" {
                            self.features.set(ProtocolFeatures::MULTIPROCESS, true);
                        }
                    }
                }

                res.write_str("PacketSize=")?;
                res.write_num(self.packet_capacity as u64)?;
                res.write_str(concat!(
                    ";qXfer:features:read+",
                    ";multiprocess+",
                    ";swbreak+",
                    ";vContSupported+",
                    ";QNonStop+",
                ))?;
                HandlerStatus::Handled
            }
            _ if head == b"qC" => {
                res.write_str("QC")?;
                self.reply_ptid(res, self.current_core())?;
                HandlerStatus::Handled
            }
            _ if head.starts_with(b"qAttached") => {
                // always attached to an existing process
                res.write_str("1")?;
                HandlerStatus::Handled
            }
            _ if head == b"qfThreadInfo" => {
                self.next_process = 0;
                self.write_next_thread_info(res)?;
                HandlerStatus::Handled
            }
            _ if head == b"qsThreadInfo" => {
                self.write_next_thread_info(res)?;
                HandlerStatus::Handled
            }
            _ if head.starts_with(b"qRcmd,") => {
                let (_, hex) = body.split_at_mut(6);
                self.handle_monitor(res, target, hex)?
            }
            _ if head.starts_with(b"qXfer:features:read:") => {
                let window = &body[20..];
                self.handle_features_read(res, window)?;
                HandlerStatus::Handled
            }
            _ if head.starts_with(b"QNonStop:") => {
                self.stop_mode = match body.get(9).copied() {
                    Some(b'0') => StopMode::AllStop,
                    Some(b'1') => StopMode::NonStop,
                    _ => return Err(Error::NonFatal(1)),
                };
                HandlerStatus::NeedsOk
            }
            _ => {
                info!(
                    "unsupported query: {:?}",
                    core::str::from_utf8(body).unwrap_or("<binary>")
                );
                HandlerStatus::Handled
            }
        };
        Ok(handler_status)
    }

    /// Report one live core per request, `l` once the cursor runs out.
    fn write_next_thread_info<C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
    ) -> Result<(), crate::protocol::ResponseWriterError<C::Error>> {
        while self.next_process < self.cores.cpu_count() {
            let core = self.next_process;
            self.next_process += 1;
            if self.cores[core].is_live() {
                res.write_str("m")?;
                return self.reply_ptid(res, core);
            }
        }
        res.write_str("l")
    }

    /// `qXfer:features:read:<annex>:<offset>,<length>`
    fn handle_features_read<T, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        args: &[u8],
    ) -> Result<(), Error<T, C::Error>> {
        let (annex, window) = split1(args, b':').ok_or(Error::NonFatal(1))?;
        if annex != b"target.xml" {
            res.write_str("E00")?;
            return Ok(());
        }

        let (offset, length) = split1(window, b',').ok_or(Error::NonFatal(1))?;
        let offset: usize = decode_hex(offset).map_err(|_| Error::NonFatal(1))?;
        let length: usize = decode_hex(length).map_err(|_| Error::NonFatal(1))?;

        let xml = TARGET_XML.as_bytes();
        if offset >= xml.len() {
            res.write_str("l")?;
            return Ok(());
        }

        // leave room for the 'm' marker and the frame overhead
        let budget = length.min(self.packet_capacity - 8);
        let end = xml.len().min(offset + budget);
        res.write_str("m")?;
        res.write_all(&xml[offset..end])?;
        Ok(())
    }
}
