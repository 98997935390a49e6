use bridge_traits::error::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Invalid directory URL '{url}': {reason}")]
    InvalidDirectoryUrl { url: String, reason: String },

    #[error("Refusing to sync with this instance's own directory: {0}")]
    SelfReference(String),

    #[error("Fetching {url} failed: {message}")]
    Fetch {
        url: String,
        /// HTTP status when the peer answered; `None` for transport failures
        status: Option<u16>,
        message: String,
    },

    #[error("Malformed response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("Object store error: {0}")]
    Store(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl FederationError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        FederationError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Status code a federation-aware endpoint answers with for this error
    pub fn http_status(&self) -> u16 {
        match self {
            FederationError::InvalidDirectoryUrl { .. } | FederationError::SelfReference(_) => 400,
            FederationError::NotFound { .. } => 404,
            FederationError::Fetch { .. } | FederationError::Parse { .. } => 502,
            FederationError::Bridge(err) if err.is_transport() => 502,
            FederationError::Store(_) | FederationError::Config(_) | FederationError::Bridge(_) => {
                500
            }
        }
    }

    /// HTTP status the peer answered with, if it answered at all
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            FederationError::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    /// Status recorded on listings when this error is the reason a peer is unavailable
    pub fn listing_status(&self) -> u16 {
        match self {
            FederationError::Fetch {
                status: Some(status),
                ..
            } => *status,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            FederationError::SelfReference("https://a.example".to_string()).http_status(),
            400
        );
        assert_eq!(FederationError::not_found("Publication", "p1").http_status(), 404);
        assert_eq!(
            FederationError::Fetch {
                url: "https://a.example".to_string(),
                status: Some(503),
                message: "Service Unavailable".to_string(),
            }
            .http_status(),
            502
        );
        assert_eq!(
            FederationError::Bridge(BridgeError::Timeout("30s".to_string())).http_status(),
            502
        );
        assert_eq!(
            FederationError::Bridge(BridgeError::DatabaseError("locked".to_string())).http_status(),
            500
        );
        assert_eq!(FederationError::Store("disk full".to_string()).http_status(), 500);
    }

    #[test]
    fn test_listing_status() {
        let err = FederationError::Fetch {
            url: "https://a.example".to_string(),
            status: Some(404),
            message: "Not Found".to_string(),
        };
        assert_eq!(err.listing_status(), 404);

        let err = FederationError::Fetch {
            url: "https://a.example".to_string(),
            status: None,
            message: "connection refused".to_string(),
        };
        assert_eq!(err.listing_status(), 500);
    }
}
