use uuid::Uuid;

/// Fatal rendezvous-session failures. The session cannot continue and the
/// manager will not retry; transient signaling loss is handled inside the
/// session implementation and never surfaces here.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("rendezvous service unreachable: {0}")]
    Unreachable(#[source] anyhow::Error),

    #[error("rendezvous service refused the session: {0}")]
    Refused(String),

    #[error("rendezvous protocol violation: {0}")]
    Protocol(String),

    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("session closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("connection to {id} failed")]
    NegotiationFailed { id: Uuid },

    #[error("mesh manager stopped")]
    Stopped,
}
