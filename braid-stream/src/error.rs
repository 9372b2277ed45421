use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("authentication failed")]
    SaslAuthFailed,

    #[error("wrong partition version")]
    WrongPartitionVersion,

    #[error("wrong start sequence number")]
    WrongStartSequenceNumber,

    #[error("partition stream already exists")]
    StreamAlreadyExists,

    #[error("partition stream not found")]
    StreamNotFound,

    #[error("server demands rollback to sequence {0}")]
    Rollback(u64),

    #[error("failover log has {0} entries, over the configured maximum")]
    TooLargeFailoverLog(usize),

    #[error("no failover log found")]
    NoFailoverLogFound,

    #[error("unmapped protocol status {0:#06x}")]
    Status(u16),

    #[error("unexpected opcode {0:#04x}")]
    UnexpectedOpcode(u8),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
