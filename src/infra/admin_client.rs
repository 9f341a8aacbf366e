//! Client side of the admin API, used by `panelcache clear`.

use std::time::Duration;

use url::Url;

use super::error::InfraError;
use super::http::{ClearRequest, InvalidationSummary};
use crate::cache::ClearTarget;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AdminClient {
    client: reqwest::Client,
    base: Url,
}

impl AdminClient {
    pub fn new(base: Url) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder().timeout(CLIENT_TIMEOUT).build()?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, InfraError> {
        self.base.join(path).map_err(|source| InfraError::Endpoint {
            base: self.base.clone(),
            path: path.to_string(),
            source,
        })
    }

    pub async fn clear(&self, target: ClearTarget) -> Result<InvalidationSummary, InfraError> {
        let response = self
            .client
            .post(self.endpoint("cache/clear")?)
            .json(&ClearRequest { target })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InfraError::AdminStatus { status, body });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_resolve_against_the_base() {
        let client = AdminClient::new(Url::parse("http://127.0.0.1:3001").unwrap()).unwrap();
        assert_eq!(
            client.endpoint("cache/clear").unwrap().as_str(),
            "http://127.0.0.1:3001/cache/clear"
        );
    }
}
