//! Error types for the gateway, the transport, and the session surface.
//!
//! A stale response (a result for a conversation that is no longer active) is
//! not an error: it is discarded where it is detected.

use tokio_tungstenite::tungstenite;

/// Failures of the persistence gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The session is no longer valid. Surfaced to observers as a blocking state.
    #[error("session is not authorized")]
    Unauthorized,

    /// Transient backend or network failure. Logged, never retried automatically.
    #[error("persistence service unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Unauthorized,
            408 | 429 => Self::Unavailable(format!("status {status}")),
            code if status.is_server_error() => Self::Unavailable(format!("status {code}")),
            code => Self::UnexpectedStatus { status: code, body },
        }
    }
}

/// Failures of the real-time transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No live connection. Reconnection is handled by the connection task.
    #[error("transport is disconnected")]
    Disconnected,

    #[error("not joined to a conversation")]
    NotJoined,

    #[error("transport connection task has stopped")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::Disconnected
            }
            other => Self::WebSocket(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("sync session has stopped")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn auth_statuses_map_to_unauthorized() {
        assert_eq!(
            GatewayError::from_status(StatusCode::UNAUTHORIZED, String::new()),
            GatewayError::Unauthorized
        );
        assert_eq!(
            GatewayError::from_status(StatusCode::FORBIDDEN, String::new()),
            GatewayError::Unauthorized
        );
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(matches!(
            GatewayError::from_status(StatusCode::BAD_GATEWAY, String::new()),
            GatewayError::Unavailable(_)
        ));
        assert!(matches!(
            GatewayError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            GatewayError::Unavailable(_)
        ));
    }

    #[test]
    fn client_errors_keep_body() {
        let err = GatewayError::from_status(StatusCode::NOT_FOUND, "no such room".into());
        assert_eq!(
            err,
            GatewayError::UnexpectedStatus {
                status: 404,
                body: "no such room".into()
            }
        );
    }

    #[test]
    fn closed_socket_is_a_disconnect() {
        assert_eq!(
            TransportError::from(tungstenite::Error::ConnectionClosed),
            TransportError::Disconnected
        );
        assert!(matches!(
            TransportError::from(tungstenite::Error::Io(std::io::Error::other("reset"))),
            TransportError::WebSocket(_)
        ));
    }

    #[test]
    fn gateway_failures_surface_through_sync_error() {
        let err: SyncError = GatewayError::Unauthorized.into();
        assert!(matches!(err, SyncError::Gateway(GatewayError::Unauthorized)));
        assert_eq!(err.to_string(), "session is not authorized");
    }
}
