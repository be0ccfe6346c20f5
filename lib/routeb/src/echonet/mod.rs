//! ECHONET Lite over Route B: frame codec, per-property codecs and the
//! request/response client.

pub mod client;
pub mod codec;
pub mod frame;

pub use self::client::ElClient;
pub use self::frame::{ElFrame, ElProperty};
