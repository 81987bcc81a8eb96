use thiserror::Error;

/// Status surfaced to the resource manager.
///
/// These are the only failure kinds a caller of [`crate::Driver`] ever sees;
/// transport and protocol errors from the lower layers are folded into
/// `Communication` unless a more specific code applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IfdError {
    #[error("communication error")]
    Communication,

    #[error("no such device")]
    NoSuchDevice,

    #[error("response timeout")]
    ResponseTimeout,

    /// Parity error reported by the reader after the T=1 engine exhausted
    /// its retry budget.
    #[error("parity error")]
    Parity,

    #[error("no card present")]
    IccNotPresent,

    #[error("protocol not supported")]
    ProtocolNotSupported,

    #[error("command or tag not supported")]
    NotSupported,

    #[error("receive buffer too small")]
    InsufficientBuffer,

    #[error("power action refused by reader")]
    PowerAction,

    #[error("PPS handshake failed")]
    PtsFailure,

    #[error("unknown channel handle")]
    UnknownHandle,
}

pub type IfdResult<T> = Result<T, IfdError>;
