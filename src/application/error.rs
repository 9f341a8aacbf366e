use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    cache::{InvalidationError, PolicyError, ScopeParseError},
    config::LoadError,
    infra::error::InfraError,
};

/// Diagnostic chain attached to error responses and picked up by the
/// response logger.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    /// Captures `error` and every error in its source chain, outermost first.
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        error: &(dyn StdError + 'static),
    ) -> Self {
        let messages = std::iter::successors(Some(error), |&current| current.source())
            .map(ToString::to_string)
            .collect();
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    residual: Option<usize>,
}

/// An error answered with a short public message and a JSON body.
#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    public_message: &'static str,
    removed: Option<usize>,
    residual: Option<usize>,
    report: ErrorReport,
}

impl HttpError {
    pub fn from_error(
        source: &'static str,
        status: StatusCode,
        public_message: &'static str,
        error: &(dyn StdError + 'static),
    ) -> Self {
        Self {
            status,
            public_message,
            removed: None,
            residual: None,
            report: ErrorReport::from_error(source, status, error),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.public_message,
            removed: self.removed,
            residual: self.residual,
        };
        let mut response = (self.status, Json(body)).into_response();
        self.report.attach(&mut response);
        response
    }
}

impl From<InvalidationError> for HttpError {
    fn from(error: InvalidationError) -> Self {
        let source = "application::error::invalidation_to_http_error";
        match &error {
            InvalidationError::Partial {
                removed, residual, ..
            } => {
                let (removed, residual) = (*removed, residual.len());
                Self {
                    removed: Some(removed),
                    residual: Some(residual),
                    ..HttpError::from_error(
                        source,
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Invalidation incomplete",
                        &error,
                    )
                }
            }
            InvalidationError::Store(_) => HttpError::from_error(
                source,
                StatusCode::SERVICE_UNAVAILABLE,
                "Cache store unavailable",
                &error,
            ),
        }
    }
}

impl From<ScopeParseError> for HttpError {
    fn from(error: ScopeParseError) -> Self {
        HttpError::from_error(
            "application::error::scope_to_http_error",
            StatusCode::BAD_REQUEST,
            "Invalid scope",
            &error,
        )
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("invalid cache policy: {0}")]
    Policy(#[from] PolicyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, ScopeTag};

    #[test]
    fn partial_invalidation_reports_counts() {
        let error = InvalidationError::Partial {
            scope: "namespace:page".to_string(),
            removed: 3,
            residual: vec![CacheKey::from_stored("page:abc")],
        };
        let http = HttpError::from(error);
        assert_eq!(http.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = http.into_response();
        let report = response.extensions().get::<ErrorReport>().unwrap();
        assert_eq!(report.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(report.messages[0].contains("namespace:page"));
    }

    #[test]
    fn report_walks_the_source_chain() {
        let error = InfraError::Serve(std::io::Error::other("listener closed"));
        let report = ErrorReport::from_error("test", StatusCode::INTERNAL_SERVER_ERROR, &error);
        assert_eq!(
            report.messages,
            vec![
                "http server stopped: listener closed".to_string(),
                "listener closed".to_string(),
            ]
        );
    }

    #[test]
    fn scope_errors_are_client_errors() {
        let error = "nonsense".parse::<ScopeTag>().unwrap_err();
        assert_eq!(HttpError::from(error).status(), StatusCode::BAD_REQUEST);
    }
}
