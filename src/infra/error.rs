use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("http server stopped: {0}")]
    Serve(#[source] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error(transparent)]
    Client(#[from] reqwest::Error),
    #[error("cannot resolve `{path}` against {base}: {source}")]
    Endpoint {
        base: Url,
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("admin api answered {status}: {body}")]
    AdminStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("upstream error: {message}")]
    Upstream { message: String },
}

impl InfraError {
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
        }
    }
}
