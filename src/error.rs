use thiserror::Error;

/// Failure kinds that callers branch on when talking to photo sources.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote host could not be reached.
    #[error("no network connection: {0}")]
    NoNetwork(String),

    /// The OAuth grant was revoked or never completed; the user must re-link.
    #[error("OAuth credentials are invalid")]
    OAuthInvalid,

    /// The access token expired and could not be refreshed.
    #[error("OAuth token expired")]
    OAuthExpired,

    #[error("request timed out")]
    Timeout,

    /// A downloaded file or state document could not be written.
    #[error("failed to save {0}")]
    FailedSaving(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The provider's API has not been enabled for the configured client.
    #[error("API not enabled: {0}")]
    ApiDisabled(String),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::OAuthInvalid | Self::OAuthExpired)
    }

    /// Short text suitable for the on-screen message and the event log.
    pub fn user_message(&self) -> String {
        match self {
            Self::NoNetwork(_) => "No network connection".to_string(),
            Self::OAuthInvalid | Self::OAuthExpired => {
                "Access to the photo service was revoked, please link it again".to_string()
            }
            Self::Timeout => "The photo service did not answer in time".to_string(),
            Self::FailedSaving(what) => format!("Unable to save {what}"),
            Self::Http { status, .. } => format!("The photo service answered with HTTP {status}"),
            Self::ApiDisabled(detail) => format!("The photo API is disabled: {detail}"),
            Self::Unknown(msg) => msg.clone(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::NoNetwork(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Unknown(err.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::FailedSaving(err.to_string())
    }
}
