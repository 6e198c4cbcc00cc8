use std::fmt;

/// Machine-readable error codes for callers that branch on failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    EmptyTitle,
    EmptyLocation,
    MalformedLocation,
    RemoteUnavailable,
    RemoteRejected,
    RemoteMalformed,
    FeedUnavailable,
    FeedClosed,
    SessionInactive,
    SessionChanged,
    ConfigParseError,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::EmptyTitle => "E1001",
            Self::EmptyLocation => "E1002",
            Self::MalformedLocation => "E1003",
            Self::RemoteUnavailable => "E2001",
            Self::RemoteRejected => "E2002",
            Self::RemoteMalformed => "E2003",
            Self::FeedUnavailable => "E3001",
            Self::FeedClosed => "E3002",
            Self::SessionInactive => "E4001",
            Self::SessionChanged => "E4002",
            Self::ConfigParseError => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::EmptyTitle => "Title is empty",
            Self::EmptyLocation => "Location is empty",
            Self::MalformedLocation => "Location is not an absolute URL",
            Self::RemoteUnavailable => "Remote store unavailable",
            Self::RemoteRejected => "Remote store rejected the request",
            Self::RemoteMalformed => "Remote store returned a malformed response",
            Self::FeedUnavailable => "Change feed could not be opened",
            Self::FeedClosed => "Change feed closed",
            Self::SessionInactive => "No active session",
            Self::SessionChanged => "Session ended before the request completed",
            Self::ConfigParseError => "Config file parse error",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint for the presentation layer.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::EmptyTitle => Some("Enter a title for the link."),
            Self::EmptyLocation => Some("Enter the link's URL."),
            Self::MalformedLocation => {
                Some("Use a full URL including the scheme, e.g. https://example.com.")
            }
            Self::RemoteUnavailable => Some("Check the connection and retry."),
            Self::RemoteRejected => Some("Sign in again; the item may belong to another account."),
            Self::RemoteMalformed | Self::InternalUnexpected => {
                Some("Retry once. If persistent, report a bug with logs.")
            }
            Self::FeedUnavailable | Self::FeedClosed => {
                Some("Live updates paused; reload to resynchronize.")
            }
            Self::SessionInactive => Some("Sign in before changing the list."),
            Self::SessionChanged => None,
            Self::ConfigParseError => Some("Fix syntax in .linkshelf/config.toml and retry."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Local pre-flight rejection. Never reaches the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("location must not be empty")]
    EmptyLocation,
    #[error("location `{location}` is not an absolute URL: {reason}")]
    MalformedLocation { location: String, reason: String },
}

impl ValidationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyTitle => ErrorCode::EmptyTitle,
            Self::EmptyLocation => ErrorCode::EmptyLocation,
            Self::MalformedLocation { .. } => ErrorCode::MalformedLocation,
        }
    }
}

/// Why a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// Network or service failure; the request may not have been seen.
    Unavailable,
    /// Policy rejection (wrong owner, expired credentials).
    Rejected,
    /// The store answered with something the engine could not use.
    Malformed,
}

/// A failed create, delete, or list call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    #[must_use]
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Rejected, message)
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self.kind {
            RemoteErrorKind::Unavailable => ErrorCode::RemoteUnavailable,
            RemoteErrorKind::Rejected => ErrorCode::RemoteRejected,
            RemoteErrorKind::Malformed => ErrorCode::RemoteMalformed,
        }
    }
}

/// Push subscription failure. Non-fatal: logged and handed to the recovery policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("change feed could not be opened: {0}")]
    Unavailable(String),
    #[error("change feed closed: {0}")]
    Closed(String),
}

impl FeedError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) => ErrorCode::FeedUnavailable,
            Self::Closed(_) => ErrorCode::FeedClosed,
        }
    }
}

/// Everything an engine operation can surface to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("no active session")]
    Inactive,
    #[error("session ended before the request completed")]
    SessionChanged,
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(err) => err.code(),
            Self::Remote(err) => err.code(),
            Self::Feed(err) => err.code(),
            Self::Inactive => ErrorCode::SessionInactive,
            Self::SessionChanged => ErrorCode::SessionChanged,
        }
    }

    /// Whether the failure happened before any remote call was made.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Inactive)
    }
}
