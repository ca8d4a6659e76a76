use thiserror::Error;

/// Failures surfaced to application code. All of them are scoped to a single connection (or a
///  single call), none is fatal to the connection manager.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The peer sent something that contradicts the protocol. The packet was dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The receive buffer had no room for a block; the peer's retransmission will recover it
    #[error("receive buffer capacity exceeded")]
    CapacityExceeded,

    #[error("timed out")]
    Timeout,

    /// A block could not be delivered, e.g. because it exceeded the maximum number of resends
    ///  or because the connection was torn down while it was outstanding
    #[error("write failed")]
    WriteFailure,

    #[error("connection was reset")]
    Reset,

    #[error("connection is closed")]
    Closed,

    #[error("maximum number of concurrent streams reached")]
    ConnectionLimit,

    /// Connection options passed by the application failed validation
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),

    #[error("session error: {0}")]
    Session(#[from] anyhow::Error),
}

impl StreamError {
    /// true for errors that leave the connection usable, i.e. a retry of the same call may
    ///  succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Timeout | StreamError::CapacityExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::timeout(StreamError::Timeout, true)]
    #[case::capacity(StreamError::CapacityExceeded, true)]
    #[case::reset(StreamError::Reset, false)]
    #[case::write_failure(StreamError::WriteFailure, false)]
    #[case::closed(StreamError::Closed, false)]
    #[case::invalid_options(StreamError::InvalidOptions("x".to_string()), false)]
    fn test_is_transient(#[case] error: StreamError, #[case] expected: bool) {
        assert_eq!(error.is_transient(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamError::ProtocolViolation("NACK above ack".to_string()).to_string(), "protocol violation: NACK above ack");
        assert_eq!(StreamError::from(anyhow::anyhow!("boom")).to_string(), "session error: boom");
    }
}
