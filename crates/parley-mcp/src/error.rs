//! Catalog error taxonomy

use thiserror::Error;

/// Why a tool server could not be resolved or used
///
/// `Clone` so one failure can be shared by every caller coalesced onto the
/// same cache load.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("transport failure talking to '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("'{server}' did not answer within {seconds}s")]
    Timeout { server: String, seconds: u64 },

    #[error("'{server}' returned error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("unexpected response from '{server}': {message}")]
    Protocol { server: String, message: String },

    #[error("invalid descriptor for '{server}': {message}")]
    InvalidDescriptor { server: String, message: String },
}

impl CatalogError {
    pub fn server(&self) -> &str {
        match self {
            Self::Transport { server, .. }
            | Self::Timeout { server, .. }
            | Self::Rpc { server, .. }
            | Self::Protocol { server, .. }
            | Self::InvalidDescriptor { server, .. } => server,
        }
    }

    /// Failures worth retrying and that invalidate a cached connection
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    pub(crate) fn transport(server: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            server: server.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn protocol(server: &str, message: impl Into<String>) -> Self {
        Self::Protocol {
            server: server.to_string(),
            message: message.into(),
        }
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(CatalogError::transport("a", "refused").is_transport());
        assert!(
            CatalogError::Timeout {
                server: "a".to_string(),
                seconds: 30
            }
            .is_transport()
        );
        assert!(!CatalogError::protocol("a", "bad json").is_transport());
    }

    #[test]
    fn test_display_names_server() {
        let err = CatalogError::Rpc {
            server: "weather".to_string(),
            code: -32601,
            message: "Method not found".to_string(),
        };
        assert_eq!(err.server(), "weather");
        assert!(err.to_string().contains("weather"));
        assert!(err.to_string().contains("-32601"));
    }
}
