//! Forwarding of public traffic to the origin.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use tracing::{instrument, warn};
use url::Url;

use crate::application::error::HttpError;
use crate::config::UpstreamSettings;
use crate::infra::error::InfraError;

/// Headers that describe a single connection and are never forwarded.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[derive(Clone)]
pub struct ProxyState {
    client: reqwest::Client,
    upstream: Url,
}

impl ProxyState {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            upstream: settings.url.clone(),
        })
    }

    async fn forward(&self, request: Request<Body>) -> Result<Response, InfraError> {
        let (parts, body) = request.into_parts();
        let body = BodyExt::collect(body)
            .await
            .map_err(|err| InfraError::upstream(format!("failed to read request body: {err}")))?
            .to_bytes();

        let upstream = self
            .client
            .request(parts.method, upstream_url(&self.upstream, &parts.uri))
            .headers(forwardable(&parts.headers, true))
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let headers = forwardable(upstream.headers(), false);
        let body = upstream.bytes().await?;

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Joins the request path onto the upstream base path, keeping the query.
fn upstream_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();
    let path = format!("{}{}", base.path().trim_end_matches('/'), uri.path());
    url.set_path(&path);
    url.set_query(uri.query());
    url
}

fn forwardable(headers: &HeaderMap, request: bool) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        // Set by reqwest for the outgoing request.
        if request && (*name == header::HOST || *name == header::CONTENT_LENGTH) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_handler(State(proxy): State<ProxyState>, request: Request<Body>) -> Response {
    match proxy.forward(request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(upstream = %proxy.upstream, error = %err, "Upstream request failed");
            HttpError::from_error(
                "infra::http::proxy_handler",
                StatusCode::BAD_GATEWAY,
                "Upstream unavailable",
                &err,
            )
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn request_path_is_appended_to_the_base_path() {
        let base = Url::parse("http://origin.internal:8080/panel/").unwrap();
        let uri: Uri = "/admin/users?tab=active".parse().unwrap();
        assert_eq!(
            upstream_url(&base, &uri).as_str(),
            "http://origin.internal:8080/panel/admin/users?tab=active"
        );

        let root = Url::parse("http://origin.internal").unwrap();
        let uri: Uri = "/admin".parse().unwrap();
        assert_eq!(upstream_url(&root, &uri).as_str(), "http://origin.internal/admin");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::HOST, HeaderValue::from_static("cache.local"));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=1"));

        let request = forwardable(&headers, true);
        assert!(request.get(header::CONNECTION).is_none());
        assert!(request.get(header::HOST).is_none());
        assert!(request.get(header::COOKIE).is_some());

        let response = forwardable(&headers, false);
        assert!(response.get(header::HOST).is_some());
    }
}
