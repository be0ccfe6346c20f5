//! Line-oriented driver for Wi-SUN "SK" radio modules.
//!
//! The module speaks an AT-style command set over a serial device: uppercase
//! ASCII commands terminated by CRLF, answered by `OK`/`FAIL ERxx` lines and
//! interleaved with unsolicited event lines (`EVENT`, `EPANDESC`, `ERXUDP`).
//! This crate frames the byte stream, serialises command/ack exchanges and
//! fans unsolicited events out to subscribers.

pub mod command;
pub mod event;
pub mod framer;
pub mod logging;
pub mod module;
pub mod port;

pub use crate::command::{Command, Expect};
pub use crate::event::{PanDesc, RxUdp, SkEvent};
pub use crate::framer::PayloadMode;
pub use crate::module::SkModule;

use std::fmt;
use std::io;

pub type SkResult<T> = Result<T, SkError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkError {
    /// The serial transport failed. The module is unusable until reopened.
    Io(io::ErrorKind),
    /// The expected terminator did not arrive within the caller's timeout.
    Timeout,
    /// The command slot did not free up in time; the reader is presumed stuck.
    Busy,
    /// The module answered `FAIL ERxx`; the payload is the error code.
    CommandFailed(String),
    /// The module has been shut down or latched dead by a fatal error.
    Closed,
}

impl fmt::Display for SkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SkError::Io(kind) => write!(f, "serial i/o error: {:?}", kind),
            SkError::Timeout => write!(f, "command response timed out"),
            SkError::Busy => write!(f, "command slot busy"),
            SkError::CommandFailed(code) => write!(f, "module answered FAIL {}", code),
            SkError::Closed => write!(f, "module closed"),
        }
    }
}

impl std::error::Error for SkError {}

impl From<io::Error> for SkError {
    #[inline]
    fn from(err: io::Error) -> Self {
        SkError::Io(err.kind())
    }
}
