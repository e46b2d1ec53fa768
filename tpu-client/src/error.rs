use time::Date;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the portal client.
///
/// The portal is an unofficial, undocumented surface. `Protocol` means the
/// portal no longer looks like this client expects and the integration
/// itself needs maintenance; it is never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Credentials rejected, or a session could not be (re)established.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure, timeout or 5xx. Transient; callers retry on their
    /// next scheduled poll, the client itself does not loop.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Response did not match the expected shape.
    #[error("unexpected portal response: {0}")]
    Protocol(String),

    /// Caller-supplied date range with `from` after `to`.
    #[error("invalid date range: {from} is after {to}")]
    InvalidRange { from: Date, to: Date },
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}
