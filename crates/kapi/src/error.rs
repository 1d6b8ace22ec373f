//! The control-plane error taxonomy.
//!
//! Domain errors are values, not exceptions: validators and managers return
//! them through `Result` and the HTTP edge lifts them to status codes. Only
//! the outermost glue (the daemon binary, watch-loop supervisors) falls back
//! to `anyhow`.

use thiserror::Error;

/// Message shown to non-admin callers in place of internal failure detail.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal error, please contact administrator";

/// All error kinds the control plane surfaces to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// A request failed schema or semantic validation.
    #[error("{0}")]
    Validation(String),

    /// The caller may not perform this operation.
    #[error("{0}")]
    PermissionDenied(String),

    /// The referenced entity does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The operation conflicts with current state (duplicate name, busy
    /// resource, concurrent command).
    #[error("{0}")]
    Conflict(String),

    /// No pool has a free IP satisfying the constraints.
    #[error("There are no free public IP-addresses, contact KuberDock administrator")]
    NoFreeIps,

    /// Requested persistent-disk size is outside the allowed range.
    #[error("Persistent disk size must be between 1 and {max_size} GB")]
    PdSizeLimit {
        /// The configured ceiling, GB.
        max_size: i64,
    },

    /// The persistent disk is attached to another pod.
    #[error("Persistent disk is already used by pod \"{pod}\"")]
    PdIsUsed {
        /// The pod holding the disk.
        pod: String,
    },

    /// The image exists but cannot be read (missing, private, bad creds).
    #[error("Image \"{image}\" is not available")]
    ImageNotAvailable {
        /// The offending image reference.
        image: String,
    },

    /// The registry itself is down or misbehaving.
    #[error("It seems that the registry {registry} is not available now ({reason}). Try again later or contact your administrator for support")]
    Registry {
        /// Registry host.
        registry: String,
        /// Short reason.
        reason: String,
    },

    /// Too many failed registry logins; the caller must pause.
    #[error("To prevent blocking of the user name wait for {seconds} seconds before next login attempt")]
    RegistryLoginPause {
        /// Seconds left until the next attempt is allowed.
        seconds: i64,
    },

    /// Neither the container spec nor the image provides a startup command.
    #[error("You need to specify CMD or ENTRYPOINT for container \"{container}\", because image \"{image}\" does not provide one")]
    CommandIsMissing {
        /// Container name.
        container: String,
        /// Image reference.
        image: String,
    },

    /// The request named an unknown API version.
    #[error("Invalid API version: {0}")]
    InvalidApiVersion(String),

    /// The billing collaborator refused or failed the operation.
    #[error("{0}")]
    Billing(String),

    /// The cluster is under maintenance; mutating commands are refused.
    #[error("Sorry, KuberDock is under maintenance. Please, wait until it is completed")]
    MaintenanceMode,

    /// The Kubernetes API refused a request.
    #[error("Kubernetes API error: {message}")]
    KubeApi {
        /// HTTP status reported by the API server.
        status: u16,
        /// The API server's message.
        message: String,
    },

    /// Any unexpected failure; detail is logged, not shown to users.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status this error maps to at the API edge.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::InvalidApiVersion(_) => 400,
            Error::PermissionDenied(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_)
            | Error::NoFreeIps
            | Error::PdSizeLimit { .. }
            | Error::PdIsUsed { .. }
            | Error::CommandIsMissing { .. } => 409,
            Error::RegistryLoginPause { .. } => 429,
            Error::ImageNotAvailable { .. }
            | Error::Registry { .. }
            | Error::MaintenanceMode => 503,
            Error::Billing(_) => 402,
            Error::KubeApi { status, .. } => *status,
            Error::Internal(_) => 500,
        }
    }

    /// The message a caller should see: admins get the real detail,
    /// everyone else gets a generic internal-error line for 5xx internals.
    pub fn user_message(&self, is_admin: bool) -> String {
        match self {
            Error::Internal(_) if !is_admin => INTERNAL_ERROR_MESSAGE.to_owned(),
            other => other.to_string(),
        }
    }

    /// Render the versioned JSON response envelope: v1 carries the message
    /// in `data`, v2 in `message`.
    pub fn to_envelope(&self, version: ApiVersion, is_admin: bool) -> serde_json::Value {
        let message = self.user_message(is_admin);
        match version {
            ApiVersion::V1 => serde_json::json!({"status": "error", "data": message}),
            ApiVersion::V2 => serde_json::json!({"status": "error", "message": message}),
        }
    }
}

/// The `kuberdock-api-version` header values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiVersion {
    /// Version 1: error text in the `data` field.
    V1,
    /// Version 2: error text in the `message` field.
    V2,
}

impl std::str::FromStr for ApiVersion {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "v1" => Ok(ApiVersion::V1),
            "v2" => Ok(ApiVersion::V2),
            other => Err(Error::InvalidApiVersion(other.to_owned())),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound("no such item".to_owned()),
            other => Error::Internal(format!("database error: {}", other)),
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => Error::KubeApi {
                status: response.code,
                message: response.message,
            },
            other => Error::Internal(format!("kubernetes client error: {}", other)),
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Internal(format!("redis error: {}", err))
    }
}

impl From<registry_probe::ProbeError> for Error {
    fn from(err: registry_probe::ProbeError) -> Self {
        use registry_probe::ProbeError;
        match err {
            ProbeError::ImageNotAvailable { image } => Error::ImageNotAvailable { image },
            ProbeError::Registry { registry, reason } => Error::Registry { registry, reason },
            ProbeError::InvalidReference(reference) => {
                Error::Validation(format!("invalid image url: {}", reference))
            }
            ProbeError::MalformedResponse { registry, detail } => Error::Registry {
                registry,
                reason: detail,
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization error: {}", err))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_codes_match_the_taxonomy() {
        assert_eq!(Error::Validation("bad".into()).http_status(), 400);
        assert_eq!(Error::PermissionDenied("no".into()).http_status(), 403);
        assert_eq!(Error::NotFound("gone".into()).http_status(), 404);
        assert_eq!(Error::Conflict("dup".into()).http_status(), 409);
        assert_eq!(Error::NoFreeIps.http_status(), 409);
        assert_eq!(Error::PdSizeLimit { max_size: 10 }.http_status(), 409);
        assert_eq!(Error::RegistryLoginPause { seconds: 3 }.http_status(), 429);
        assert_eq!(Error::MaintenanceMode.http_status(), 503);
        assert_eq!(Error::Internal("boom".into()).http_status(), 500);
    }

    #[test]
    fn internal_detail_is_hidden_from_users() {
        let err = Error::Internal("connection pool exhausted".into());
        assert_eq!(err.user_message(false), INTERNAL_ERROR_MESSAGE);
        assert_eq!(err.user_message(true), "connection pool exhausted");
    }

    #[test]
    fn envelope_field_depends_on_api_version() {
        let err = Error::NotFound("no such pod".into());
        let v1 = err.to_envelope(ApiVersion::V1, false);
        let v2 = err.to_envelope(ApiVersion::V2, false);
        assert_eq!(v1["data"], "no such pod");
        assert_eq!(v2["message"], "no such pod");
        assert!(v1.get("message").is_none());
    }

    #[test]
    fn api_version_parses_known_values_only() {
        assert_eq!(ApiVersion::from_str("v1").unwrap(), ApiVersion::V1);
        assert_eq!(ApiVersion::from_str("v2").unwrap(), ApiVersion::V2);
        assert!(matches!(
            ApiVersion::from_str("v3"),
            Err(Error::InvalidApiVersion(_))
        ));
    }
}
