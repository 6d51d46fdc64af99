use thiserror::Error;

/// Errors surfaced while framing or executing a single command.
///
/// `Protocol` errors are connection-fatal (the frame could not be trusted,
/// so the connection is closed without a reply); everything else is turned
/// into a `-ERR ...` reply and the connection carries on.
#[derive(Debug, Error)]
pub enum RedisError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("The ID specified in XADD must be greater than 0-0")]
    XaddZero,

    #[error("The ID specified in XADD is equal or smaller than the target stream top item")]
    XaddBackward,

    #[error("Not a valid stream key")]
    WrongType,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{0}")]
    Command(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RedisError>;
