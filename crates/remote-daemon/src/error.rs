use remote_proto::protocol::InstanceState;

/// Typed failure surface for the daemon.  Transport-level noise (malformed
/// IPC lines, probe failures) is absorbed where it occurs and never reaches
/// this enum; everything here is surfaced to the caller as-is, with no
/// automatic retry.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {id} is not in a valid state ({state})")]
    InvalidState { id: String, state: InstanceState },

    #[error("failed to start instance: {0}")]
    InstanceStart(String),

    #[error("malformed IPC frame: {0}")]
    Protocol(String),

    #[error("timeout waiting for mpv response")]
    Timeout,

    #[error("IPC connection closed before a matching response arrived")]
    ConnectionClosed,

    #[error("IPC connection failed: {0}")]
    Connection(#[source] std::io::Error),

    #[error("invalid command: {0}")]
    Validation(String),

    #[error("stream already active for instance {0}")]
    StreamAlreadyActive(String),

    #[error("failed to spawn encoder: {0}")]
    EncoderSpawn(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
