//! Relay error types

/// Relay result type
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failures inside the relay. None of them stop the server; each one is
/// reported to the affected client or logged and the affected party dropped.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("username '{0}' is already in use")]
    UsernameTaken(String),

    #[error("username cannot be empty")]
    MalformedRegistration,

    #[error("failed to send to {recipient}: {reason}")]
    TransportSend { recipient: String, reason: String },

    #[error("peer link is not established")]
    PeerLinkLost,
}

impl RelayError {
    pub fn transport_send(recipient: &str, reason: impl ToString) -> Self {
        Self::TransportSend {
            recipient: recipient.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Both registration failures get the same reply on the wire.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::UsernameTaken(_) | RelayError::MalformedRegistration
        )
    }
}
