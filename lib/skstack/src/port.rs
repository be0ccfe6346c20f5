//! Serial device handling. The SK module sits behind a plain tty; the
//! reader half is a `try_clone` of the writer half so one thread can block
//! on reads while another issues commands.

use serialport::{DataBits, Parity, SerialPort, StopBits};
use std::io;
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Read timeout on the device. Doubles as the reader-thread heartbeat: every
/// expiry the thread gets a chance to observe the stop flag.
pub const READ_HEARTBEAT: Duration = Duration::from_millis(500);

pub struct SerialPair {
    pub reader: Box<dyn SerialPort>,
    pub writer: Box<dyn SerialPort>,
}

/// Open the device at `path` as 8N1 with the supplied baudrate and split it
/// into independently owned reader/writer halves.
pub fn open(path: &str, baud_rate: u32) -> io::Result<SerialPair> {
    let writer = serialport::new(path, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(READ_HEARTBEAT)
        .open()
        .map_err(into_io)?;

    let reader = writer.try_clone().map_err(into_io)?;

    Ok(SerialPair { reader, writer })
}

#[inline]
fn into_io(err: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}
