use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The identity service refused to mint a new access credential.
    ///
    /// There is no valid session server-side; callers treat this as
    /// "not authenticated", never as a transient fault.
    #[error("refresh denied by identity service (HTTP {status})")]
    RefreshDenied { status: u16 },
    #[error("login rejected: {message}")]
    LoginRejected { status: u16, message: String },
    #[error("signup rejected: {message}")]
    SignupRejected { status: u16, message: String },
    #[error("profile fetch failed: {detail}")]
    ProfileFetch { status: Option<u16>, detail: String },
    #[error("logout request failed: {0}")]
    LogoutTransport(String),
    /// A protected call was rejected again after its one refresh-and-retry.
    #[error("request unauthorized after credential refresh")]
    Unauthorized,
    #[error("no access credential is held")]
    NotAuthenticated,
    /// A protected call answered with a non-2xx status other than 401.
    #[error("request failed with HTTP {status}")]
    Status { status: u16, detail: String },
    #[error("response body could not be decoded: {0}")]
    Decode(String),
    /// Network failure observed through a shared (coalesced) call.
    #[error("transport error: {0}")]
    Transport(#[source] Arc<reqwest::Error>),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error means the user no longer has a session.
    #[must_use]
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            Self::RefreshDenied { .. } | Self::Unauthorized | Self::NotAuthenticated
        )
    }
}
