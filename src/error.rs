use std::{error, fmt, io};

/// Cause of a handler shutdown, passed to [`Work::on_close`](crate::Work::on_close).
///
/// The first reason observed by a handler wins. Errors raised while the
/// close protocol is already running are suppressed.
#[derive(Debug)]
pub enum CloseReason {
    /// Clean shutdown: local close call or end of stream from the peer.
    Finished,
    /// The inactivity timer expired.
    Timeout,
    /// A queued write exceeded the handler's write buffer budget.
    BufferExhausted,
    /// The server (or connector) is shutting down.
    Stopped,
    /// Transport level error.
    Io(io::Error),
}

impl CloseReason {
    /// True for ok-class shutdown. End of stream counts as clean.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Finished)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// True for connection breakage the server treats as routine
    /// (reset/aborted/refused peers).
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => f.write_str("finished"),
            Self::Timeout => f.write_str("inactivity timeout"),
            Self::BufferExhausted => f.write_str("write buffer exhausted"),
            Self::Stopped => f.write_str("server stopped"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl error::Error for CloseReason {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CloseReason {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
