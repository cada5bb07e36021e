use hyper::StatusCode;

/// Result type alias for proxy operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// Errors that can occur while routing a request. Each kind maps to the
/// status code the handler answers with.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProxyError {
    #[error("failed to parse url: {0}")]
    Parse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("backend unavailable")]
    Unavailable,

    #[error("failed to resolve backend: {0}")]
    Resolve(String),

    #[error("failed to dial backend: {0}")]
    Dial(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("invalid download rate: {0}")]
    Bucket(String),

    #[error("lock provider failed: {0}")]
    Lock(String),

    #[error("cluster error: {0}")]
    Cluster(#[from] cluster::ClusterError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        ProxyError::Internal(e.to_string())
    }
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Parse(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Auth(_) | ProxyError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ProxyError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Dial(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Resolve(_)
            | ProxyError::Upstream(_)
            | ProxyError::Bucket(_)
            | ProxyError::Lock(_)
            | ProxyError::Cluster(_)
            | ProxyError::Config(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Unwrap the `Arc` moka hands back for coalesced producer failures.
    pub(crate) fn shared(e: std::sync::Arc<ProxyError>) -> ProxyError {
        (*e).clone()
    }
}
