use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    Unavailable,
    LaunchFailed,
    InvalidArgument,
    UnknownProcess,
    AlreadyRegistered,
    NotRegistered,
    IllegalState,
    Unkillable,
    Timeout,
    TransportIo,
}

impl ErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Unavailable => "unavailable",
            Self::LaunchFailed => "launch_failed",
            Self::InvalidArgument => "invalid_argument",
            Self::UnknownProcess => "unknown_process",
            Self::AlreadyRegistered => "already_registered",
            Self::NotRegistered => "not_registered",
            Self::IllegalState => "illegal_state",
            Self::Unkillable => "unkillable",
            Self::Timeout => "timeout",
            Self::TransportIo => "transport_io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("channel io failed: {0}")]
    Io(String),

    #[error("channel codec failed: {0}")]
    Codec(String),

    #[error("timed out waiting for response")]
    Timeout,

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            ChannelError::Io(err.to_string())
        } else {
            ChannelError::Codec(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommunicatorError {
    #[error("launch of {host_application} failed: {detail}")]
    LaunchFailed {
        host_application: String,
        detail: String,
    },

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("channel is not available")]
    Unavailable,

    #[error("no remote process with id {0}")]
    UnknownProcess(u32),

    #[error("observer is already registered")]
    ObserverAlreadyRegistered,

    #[error("observer is not registered")]
    ObserverNotRegistered,

    #[error("{0} observer(s) still registered at shutdown")]
    ObserversStillRegistered(usize),

    #[error("process {pid} survived a hard kill")]
    Unkillable { pid: u32 },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl CommunicatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::LaunchFailed { .. } => ErrorCode::LaunchFailed,
            Self::InvalidObject(_) | Self::InvalidConfig(_) => ErrorCode::InvalidArgument,
            Self::Unavailable => ErrorCode::Unavailable,
            Self::UnknownProcess(_) => ErrorCode::UnknownProcess,
            Self::ObserverAlreadyRegistered => ErrorCode::AlreadyRegistered,
            Self::ObserverNotRegistered => ErrorCode::NotRegistered,
            Self::ObserversStillRegistered(_) => ErrorCode::IllegalState,
            Self::Unkillable { .. } => ErrorCode::Unkillable,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Channel(ChannelError::Timeout) => ErrorCode::Timeout,
            Self::Channel(_) => ErrorCode::TransportIo,
        }
    }

    /// Only an unkillable process is allowed to stop the host.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unkillable { .. })
    }
}

pub type Result<T, E = CommunicatorError> = std::result::Result<T, E>;
