use std::time::Duration;

use log::info;

use super::prelude::*;
use super::DisconnectReason;
use crate::protocol::hex::decode_hex_buf;
use crate::target::ResetKind;

const HELP_TEXT: &[&str] = &[
    "monitor commands:\n",
    "  help                      this text\n",
    "  reset [warm|cold]         reset the target (default warm)\n",
    "  exit                      shut the server down\n",
    "  timeout <seconds>         continue timeout, 0 disables\n",
    "  cyclecount                report elapsed target cycles\n",
    "  instrcount                report retired instructions\n",
    "  set <param> <on|off>      rsp, exec, kill-core-on-exit\n",
    "  show <param>              report a parameter\n",
];

fn parse_bool(word: &str) -> Option<bool> {
    match word {
        "on" | "1" | "true" => Some(true),
        "off" | "0" | "false" => Some(false),
        _ => None,
    }
}

impl GdbServerImpl {
    /// `qRcmd,<hex>`: the client's `monitor` escape hatch. Output is sent as
    /// `O<hex>` console packets, then a final `OK` (or `E01`).
    pub(crate) fn handle_monitor<T: Target, C: ConnectionExt>(
        &mut self,
        res: &mut ResponseWriter<'_, C>,
        target: &mut T,
        hex: &mut [u8],
    ) -> Result<HandlerStatus, Error<T::Error, C::Error>> {
        let bytes = decode_hex_buf(hex).map_err(|_| Error::NonFatal(1))?;
        let text = core::str::from_utf8(bytes).map_err(|_| Error::NonFatal(1))?;
        info!("monitor request: {}", text);

        let mut words = text.split_whitespace();
        match words.next() {
            Some("help") => {
                for line in HELP_TEXT {
                    res.console_write(line.as_bytes())?;
                }
            }
            Some("reset") => {
                let kind = match words.next() {
                    None | Some("warm") => ResetKind::Warm,
                    Some("cold") => ResetKind::Cold,
                    Some(_) => return Err(Error::NonFatal(1)),
                };
                target.reset(kind).handle_error()?;
                self.cores.reset();
            }
            Some("exit") => {
                self.exit_reason = Some(DisconnectReason::Disconnect);
            }
            Some("timeout") => {
                let secs: u64 = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or(Error::NonFatal(1))?;
                self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            Some("cyclecount") => {
                let msg = format!("{}\n", target.cycle_count());
                res.console_write(msg.as_bytes())?;
            }
            Some("instrcount") => {
                let msg = format!("{}\n", target.instr_count());
                res.console_write(msg.as_bytes())?;
            }
            Some("set") => {
                let param = words.next().ok_or(Error::NonFatal(1))?;
                let value = words.next().ok_or(Error::NonFatal(1))?;
                let on = parse_bool(value).ok_or(Error::NonFatal(1))?;
                if param == "kill-core-on-exit" {
                    self.kill_core_on_exit = on;
                } else if !self.trace.set(param, on) {
                    return Err(Error::NonFatal(1));
                }
            }
            Some("show") => {
                let param = words.next().ok_or(Error::NonFatal(1))?;
                let value = match param {
                    "kill-core-on-exit" => self.kill_core_on_exit,
                    flag => self.trace.get(flag).ok_or(Error::NonFatal(1))?,
                };
                let msg = format!("{}: {}\n", param, if value { "on" } else { "off" });
                res.console_write(msg.as_bytes())?;
            }
            _ => return Err(Error::NonFatal(1)),
        }

        Ok(HandlerStatus::NeedsOk)
    }
}
