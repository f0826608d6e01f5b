// ── Core error types ──
//
// Caller-facing errors from devlink-core. Every public operation fails
// through `CoreError`; `kind()` collapses it onto the small set of kinds
// callers branch on. Transport-layer errors are kept (shared, since an
// operation outcome may be observed by many listeners) and reachable
// via `transport_error()`.

use std::sync::Arc;

use strum::Display;
use thiserror::Error;

use crate::transport::Route;

/// What went wrong, independent of which transport was involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// The chosen transport cannot be reached (e.g. no LAN session).
    TransportUnavailable,
    Timeout,
    /// Caller-supplied value rejected locally or by the service.
    InvalidArgument,
    /// Another write to the same property is still in flight.
    WriteInProgress,
    NotFound,
    /// Explicit cancellation. Not a failure.
    Cancelled,
    /// Credentials rejected or session expired.
    Unauthorized,
    /// Any other failure reported by the remote side.
    Remote,
}

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Routing ──────────────────────────────────────────────────────
    #[error("Transport unavailable for {dsn}: {reason}")]
    TransportUnavailable { dsn: String, reason: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Caller errors ────────────────────────────────────────────────
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("A write to {dsn}/{property} is already in progress")]
    WriteInProgress { dsn: String, property: String },

    #[error("{entity} not found: {identifier}")]
    NotFound {
        entity: &'static str,
        identifier: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Session ──────────────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Session closed")]
    SessionClosed,

    // ── Wrapped transport errors ─────────────────────────────────────
    #[error("{route} transport error: {source}")]
    Transport {
        route: Route,
        #[source]
        source: Arc<devlink_api::Error>,
    },
}

impl CoreError {
    /// Wrap a collaborator error raised on `route`.
    pub fn transport(route: Route, err: devlink_api::Error) -> Self {
        match err {
            devlink_api::Error::Authentication { message } => Self::Authentication { message },
            devlink_api::Error::Timeout { timeout_ms } => Self::Timeout { timeout_ms },
            other => Self::Transport {
                route,
                source: Arc::new(other),
            },
        }
    }

    pub(crate) fn device_not_found(dsn: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity: "device",
            identifier: dsn.to_string(),
        }
    }

    pub(crate) fn property_not_found(dsn: impl std::fmt::Display, name: &str) -> Self {
        Self::NotFound {
            entity: "property",
            identifier: format!("{dsn}/{name}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportUnavailable { .. } => ErrorKind::TransportUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::WriteInProgress { .. } => ErrorKind::WriteInProgress,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Authentication { .. } | Self::SessionClosed => ErrorKind::Unauthorized,
            Self::Transport { source, .. } => kind_of(source),
        }
    }

    /// The underlying collaborator error, if this failure came from one.
    pub fn transport_error(&self) -> Option<&devlink_api::Error> {
        match self {
            Self::Transport { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The route the failure happened on, if any.
    pub fn route(&self) -> Option<Route> {
        match self {
            Self::Transport { route, .. } => Some(*route),
            _ => None,
        }
    }

    /// Whether a later retry of a read might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::TransportUnavailable { .. } => true,
            Self::Transport { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Whether this failure says something about the LAN link itself,
    /// as opposed to the request being refused.
    pub(crate) fn is_link_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransportUnavailable | ErrorKind::Timeout | ErrorKind::Remote
        )
    }
}

fn kind_of(err: &devlink_api::Error) -> ErrorKind {
    use devlink_api::Error as E;

    match err {
        E::Authentication { .. } | E::SessionExpired => ErrorKind::Unauthorized,
        E::Timeout { .. } => ErrorKind::Timeout,
        E::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
        E::Transport(e) if e.is_connect() => ErrorKind::TransportUnavailable,
        E::LanUnavailable { .. } => ErrorKind::TransportUnavailable,
        e if e.is_not_found() => ErrorKind::NotFound,
        e if e.is_invalid_request() => ErrorKind::InvalidArgument,
        _ => ErrorKind::Remote,
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<devlink_api::Error> for CoreError {
    fn from(err: devlink_api::Error) -> Self {
        Self::transport(Route::Cloud, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_errors_map_to_kinds() {
        let cases = [
            (
                devlink_api::Error::Api {
                    status: 404,
                    message: String::new(),
                },
                ErrorKind::NotFound,
            ),
            (
                devlink_api::Error::Api {
                    status: 422,
                    message: String::new(),
                },
                ErrorKind::InvalidArgument,
            ),
            (
                devlink_api::Error::Api {
                    status: 500,
                    message: String::new(),
                },
                ErrorKind::Remote,
            ),
            (devlink_api::Error::SessionExpired, ErrorKind::Unauthorized),
            (
                devlink_api::Error::LanUnavailable {
                    dsn: "X".into(),
                    reason: "gone".into(),
                },
                ErrorKind::TransportUnavailable,
            ),
            (
                devlink_api::Error::Timeout { timeout_ms: 5 },
                ErrorKind::Timeout,
            ),
        ];

        for (err, kind) in cases {
            assert_eq!(CoreError::transport(Route::Lan, err).kind(), kind);
        }
    }

    #[test]
    fn transport_error_is_reachable() {
        let err = CoreError::transport(
            Route::Cloud,
            devlink_api::Error::Api {
                status: 503,
                message: "busy".into(),
            },
        );
        assert_eq!(err.route(), Some(Route::Cloud));
        assert_eq!(err.transport_error().and_then(devlink_api::Error::status), Some(503));
        assert!(err.is_transient());
    }

    #[test]
    fn cancelled_is_its_own_kind() {
        assert_eq!(CoreError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(!CoreError::Cancelled.is_link_failure());
    }
}
