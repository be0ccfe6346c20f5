//! Typed constructors for the SK command set and the terminator predicates
//! that decide when a submitted command's response is complete.

use crate::event::codes;

/// Outbound command. `line()` renders the exact text put on the wire (CRLF
/// excluded); `expect()` names the response terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SkVer,
    SkInfo,
    SkReset,
    /// Read the current payload-rendering mode. Unsupported on some firmware
    /// (`FAIL ER04`), which callers must tolerate.
    Ropt,
    /// Persist the payload-rendering mode (`01` = ASCII).
    Wopt(u8),
    SkSetPwd(String),
    SkSetRbid(String),
    /// Active scan over the channels selected by `mask`.
    SkScan { mask: u32, duration: u8 },
    /// Derive the IPv6 link-local address for a 64-bit MAC.
    SkLl64 { addr: u64 },
    /// Write a virtual register (`S2` = channel, `S3` = PAN id).
    SkSreg { register: u8, value: u32 },
    /// Start PANA authentication against the coordinator.
    SkJoin { ipaddr: String },
    /// Re-run PANA authentication on the established session.
    SkRejoin,
    SkTerm,
    /// Send a UDP datagram. The payload is rendered as uppercase hex (ASCII
    /// payload mode is assumed for transmission).
    SkSendTo {
        handle: u8,
        ipaddr: String,
        port: u16,
        sec: u8,
        side: u8,
        data: Vec<u8>,
    },
}

impl Command {
    pub fn line(&self) -> String {
        match self {
            Command::SkVer => "SKVER".to_string(),
            Command::SkInfo => "SKINFO".to_string(),
            Command::SkReset => "SKRESET".to_string(),
            Command::Ropt => "ROPT".to_string(),
            Command::Wopt(mode) => format!("WOPT {:02X}", mode),
            Command::SkSetPwd(password) => {
                format!("SKSETPWD {:X} {}", password.len(), password)
            }
            Command::SkSetRbid(rbid) => format!("SKSETRBID {}", rbid),
            Command::SkScan { mask, duration } => {
                format!("SKSCAN 2 {:08X} {:X}", mask, duration)
            }
            Command::SkLl64 { addr } => format!("SKLL64 {:016X}", addr),
            Command::SkSreg { register, value } => {
                format!("SKSREG S{:X} {:X}", register, value)
            }
            Command::SkJoin { ipaddr } => format!("SKJOIN {}", ipaddr),
            Command::SkRejoin => "SKREJOIN".to_string(),
            Command::SkTerm => "SKTERM".to_string(),
            Command::SkSendTo {
                handle,
                ipaddr,
                port,
                sec,
                side,
                data,
            } => format!(
                "SKSENDTO {} {} {:04X} {} {} {:04X} {}",
                handle,
                ipaddr,
                port,
                sec,
                side,
                data.len(),
                hex::encode_upper(data)
            ),
        }
    }

    /// Rendering safe for logs: the Route-B password never appears.
    pub fn loggable(&self) -> String {
        match self {
            Command::SkSetPwd(password) => format!("SKSETPWD {:X} <redacted>", password.len()),
            other => other.line(),
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            // The scan answers OK immediately; the exchange is over when the
            // completion event arrives, with EPANDESC blocks in between.
            Command::SkScan { .. } => Expect::Events(&[codes::SCAN_COMPLETE]),
            // SKLL64 answers with a bare address line and no OK.
            Command::SkLl64 { .. } => Expect::Answer,
            _ => Expect::Ok,
        }
    }
}

/// Terminator predicate for a pending command. Unsolicited events never
/// satisfy `Ok` or `Answer`; only `Events` consumes event lines, and only
/// the listed codes complete it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Complete on `OK` / `FAIL ERxx`.
    Ok,
    /// Complete on the first line that is neither the echo nor an event.
    Answer,
    /// Accumulate lines (events included) until one of the listed event
    /// codes is seen. `FAIL` still aborts.
    Events(&'static [u8]),
}

impl Expect {
    #[inline]
    pub(crate) fn event_terminates(&self, code: u8) -> bool {
        match self {
            Expect::Events(codes) => codes.contains(&code),
            _ => false,
        }
    }
}

/// Extract the `ERxx` code from a `FAIL ERxx` line.
#[inline]
pub(crate) fn fail_code(line: &str) -> String {
    line.trim_start_matches("FAIL").trim().to_string()
}
