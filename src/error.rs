use core::fmt;

/// Stack-wide operation outcome.
///
/// Errors are returned, never raised; real-time paths handle them locally
/// (typically by dropping the packet and bumping a counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The originating pool is exhausted.
    OutOfBuffers,
    /// A compensated pool transfer failed; the packet was dropped to keep
    /// the origin pool at quota.
    OutOfCompensation,
    /// Routing produced no destination for the given address.
    HostUnreachable,
    /// The egress device is not up.
    NetDown,
    /// A size limit of a bounded structure would be violated.
    MsgTooLarge,
    /// A blocking receive expired.
    TimedOut,
    /// A non-blocking receive found the queue empty.
    WouldBlock,
    /// A configuration change hit a still-referenced resource; retry from
    /// non-real-time context.
    Busy,
    /// Structural add: the entry already exists.
    AlreadyExists,
    /// Structural remove/lookup: no such entry.
    NotFound,
    /// The socket was closed while the operation was in flight.
    NotSocket,
    /// A send on an unconnected socket without a destination address.
    NotConnected,
    /// A bounded registry (sockets, packet types) is fully occupied.
    Again,
    /// Malformed argument, e.g. a bind into the reserved auto-port range.
    InvalidInput,
    /// The operation is forbidden in the calling context.
    AccessDenied,
    /// The operation is not supported by this socket family or device.
    Unsupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfBuffers => write!(f, "packet buffer pool exhausted"),
            Error::OutOfCompensation => write!(f, "compensation pool exhausted"),
            Error::HostUnreachable => write!(f, "host unreachable"),
            Error::NetDown => write!(f, "network device is down"),
            Error::MsgTooLarge => write!(f, "message too large"),
            Error::TimedOut => write!(f, "timed out"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Busy => write!(f, "resource busy"),
            Error::AlreadyExists => write!(f, "entry already exists"),
            Error::NotFound => write!(f, "entry not found"),
            Error::NotSocket => write!(f, "socket closed"),
            Error::NotConnected => write!(f, "socket not connected"),
            Error::Again => write!(f, "no free slot available"),
            Error::InvalidInput => write!(f, "invalid argument"),
            Error::AccessDenied => write!(f, "operation forbidden in this context"),
            Error::Unsupported => write!(f, "operation not supported"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;
