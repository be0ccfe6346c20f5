use skstack::SkError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// User-visible failure kinds. Lower-layer faults are folded into these at
/// the session-manager boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// No PAN was discovered after the scan ladder reached its maximum.
    /// Retryable, possibly at another location or with corrected
    /// credentials.
    ScanFailure,
    /// PANA authentication was rejected or timed out. Retryable.
    JoinFailure,
    /// The session is lost: serial stall, expired gate or response wait, or
    /// the module latched dead. Only a fresh open recovers.
    NeedToReopen,
    /// The meter rejected one or more properties of a Get/SetC aggregate.
    /// The caller may reissue without the offending EPCs.
    ResponsePossibleFailure { epcs: Vec<u8> },
    /// A response EDT did not decode per the property's codec.
    MalformedResponse { epc: u8 },
    /// Argument outside its documented domain; raised before any I/O.
    InvalidArgument(&'static str),
    /// The configuration could not be loaded or failed validation.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ScanFailure => write!(f, "no PAN discovered after escalating the scan"),
            Error::JoinFailure => write!(f, "PANA authentication rejected or timed out"),
            Error::NeedToReopen => write!(f, "session lost; reopen required"),
            Error::ResponsePossibleFailure { epcs } => {
                write!(f, "meter rejected properties:")?;
                for epc in epcs {
                    write!(f, " {:#04X}", epc)?;
                }
                Ok(())
            }
            Error::MalformedResponse { epc } => {
                write!(f, "malformed response data for property {:#04X}", epc)
            }
            Error::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Error::Config(what) => write!(f, "configuration error: {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<SkError> for Error {
    /// Default folding for contexts without a more specific meaning: every
    /// transport-level fault requires a reopen.
    #[inline]
    fn from(_err: SkError) -> Self {
        Error::NeedToReopen
    }
}
