// src/core/pmd_source.rs

//! Default [`PmdPort`]: fetches documents over HTTP(S) via `reqwest`,
//! honoring per-source headers, client-certificate identity, and the
//! insecure flag. Grounded on the teacher's `cache_fetch.rs` request
//! pattern: a timeout-bound client, status-code handling, errors converted
//! through `SourceMgrError`'s `From<reqwest::Error>`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;

use crate::core::errors::SourceMgrError;
use crate::core::model::ClientIdentity;
use crate::core::ports::{FetchedDocument, PmdPort, RemoteValidation, RemoteValidatorPort};

pub struct ReqwestPmdSource {
    timeout: Duration,
}

impl ReqwestPmdSource {
    pub fn new(timeout: Duration) -> Self {
        ReqwestPmdSource { timeout }
    }

    fn build_client(&self, identity: Option<&ClientIdentity>, insecure: bool) -> Result<reqwest::Client, SourceMgrError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(insecure);
        if let Some(identity) = identity {
            builder = builder.identity(identity.identity.clone());
        }
        builder
            .build()
            .map_err(|e| SourceMgrError::Http(format!("building http client: {e}")))
    }

    fn build_headers(raw: &[String]) -> Result<HeaderMap, SourceMgrError> {
        let mut map = HeaderMap::new();
        for line in raw {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = HeaderName::from_bytes(name.trim().as_bytes())
                .map_err(|e| SourceMgrError::InvalidArgument(format!("invalid header name: {e}")))?;
            let value = HeaderValue::from_str(value.trim())
                .map_err(|e| SourceMgrError::InvalidArgument(format!("invalid header value: {e}")))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

#[async_trait]
impl PmdPort for ReqwestPmdSource {
    async fn fetch(
        &self,
        url: &url::Url,
        headers: &[String],
        identity: Option<&ClientIdentity>,
        insecure: bool,
    ) -> Result<FetchedDocument, SourceMgrError> {
        let client = self.build_client(identity, insecure)?;
        let header_map = Self::build_headers(headers)?;

        let response = client.get(url.clone()).headers(header_map).send().await?;
        if !response.status().is_success() {
            return Err(SourceMgrError::Http(format!(
                "unexpected status {} fetching {url}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        Ok(FetchedDocument { body, content_type })
    }
}

/// Default [`RemoteValidatorPort`]: posts the raw document to a configured
/// HTTP endpoint and expects a `{"ok": bool, "messages": [string]}` reply.
pub struct HttpRemoteValidator {
    client: reqwest::Client,
    endpoint: url::Url,
}

#[derive(Deserialize)]
struct RemoteValidationResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<String>,
}

impl HttpRemoteValidator {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Result<Self, SourceMgrError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceMgrError::Http(format!("building http client: {e}")))?;
        Ok(HttpRemoteValidator { client, endpoint })
    }
}

#[async_trait]
impl RemoteValidatorPort for HttpRemoteValidator {
    async fn validate(&self, document: &[u8]) -> Result<RemoteValidation, SourceMgrError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(document.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SourceMgrError::Http(format!(
                "unexpected status {} from remote validator",
                response.status()
            )));
        }
        let parsed: RemoteValidationResponse = response
            .json()
            .await
            .map_err(|e| SourceMgrError::Http(format!("decoding remote validator response: {e}")))?;
        Ok(RemoteValidation {
            ok: parsed.ok,
            messages: parsed.messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_malformed_header_line() {
        let err = ReqwestPmdSource::build_headers(&["not a header".to_string()]).unwrap();
        // A line without a colon is silently skipped rather than rejected,
        // matching how optional extra headers are specified in config.
        assert!(err.is_empty());
    }

    #[test]
    fn parses_a_well_formed_header_line() {
        let headers = ReqwestPmdSource::build_headers(&["X-Api-Key: secret".to_string()]).unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "secret");
    }
}
