//! Errors surfaced while talking to a Docker registry.
use thiserror::Error;

/// Probe failure taxonomy.
///
/// `Registry` means the registry itself misbehaved (down, timing out,
/// serving errors); `ImageNotAvailable` means the registry answered but the
/// image cannot be read with the given credentials.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The image reference could not be parsed.
    #[error("invalid image url: {0}")]
    InvalidReference(String),

    /// The image does not exist or is not readable with the given credentials.
    #[error("image \"{image}\" is not available")]
    ImageNotAvailable {
        /// The image reference as given by the caller
        image: String,
    },

    /// The registry is not available.
    #[error("registry {registry} is not available now ({reason}). Try again later or contact your administrator for support")]
    Registry {
        /// Registry host
        registry: String,
        /// Short failure reason (HTTP status or transport error)
        reason: String,
    },

    /// The registry returned a payload we could not decode.
    #[error("unexpected response from {registry}: {detail}")]
    MalformedResponse {
        /// Registry host
        registry: String,
        /// What failed to decode
        detail: String,
    },
}

impl ProbeError {
    pub(crate) fn registry(registry: &str, reason: impl ToString) -> Self {
        ProbeError::Registry {
            registry: registry.to_owned(),
            reason: reason.to_string(),
        }
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        let registry = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("<unknown>")
            .to_owned();
        let reason = if err.is_timeout() {
            "timeout error".to_owned()
        } else if err.is_connect() {
            "connection error".to_owned()
        } else {
            err.to_string()
        };
        ProbeError::Registry { registry, reason }
    }
}
