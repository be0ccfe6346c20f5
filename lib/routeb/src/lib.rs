//! Client for low-voltage smart electric energy meters over Japan's
//! Route B service.
//!
//! The stack, bottom up: the [`skstack`] crate drives the Wi-SUN radio
//! module over serial; [`session`] performs PAN discovery and PANA
//! authentication and gates transmissions; [`echonet`] speaks ECHONET Lite
//! over UDP to the meter; [`meter`] exposes the named property operations.
//!
//! ```no_run
//! use routeb::{Config, Meter};
//!
//! let config = Config::new("/dev/ttyUSB0", "<route-b id>", "<password>");
//! let meter = Meter::open(&config, None)?;
//!
//! let watts = meter.get_instantaneous_power()?;
//! println!("drawing {} W", watts);
//!
//! meter.close();
//! # Ok::<(), routeb::Error>(())
//! ```

pub mod config;
pub mod echonet;
pub mod error;
pub mod meter;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::meter::{Direction, HistoricalEnergy, Meter};
pub use crate::session::{Session, SessionState};

// Re-exported so applications can build the sinks without depending on the
// radio crate directly.
pub use skstack::logging;
