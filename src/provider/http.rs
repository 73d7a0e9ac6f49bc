//! Generic REST/JSON provider adapter.
//!
//! Resources are managed through three endpoints:
//! - `POST {endpoint}/resources/{type}` with `{"attributes": {...}}`,
//!   answered by `{"id": "...", "outputs": {...}}`
//! - `PATCH {endpoint}/resources/{type}/{id}` with
//!   `{"attributes": {...}, "changed": [...]}`, answered by `{"outputs": {...}}`
//! - `DELETE {endpoint}/resources/{type}/{id}`

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;

use super::adapter::{Attributes, CreateOutcome, ProviderResult, ResourceProvider};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry delay used when a 429 carries no usable `retry-after` header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// REST provider adapter.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    attributes: &'a Attributes,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a Attributes,
    changed: &'a [String],
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Attributes,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    outputs: Attributes,
}

impl HttpProvider {
    /// Creates a new REST adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> ProviderResult<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates an adapter with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_url(&self, resource_type: &str) -> String {
        format!("{}/resources/{resource_type}", self.endpoint)
    }

    fn item_url(&self, resource_type: &str, external_id: &str) -> String {
        format!("{}/resources/{resource_type}/{external_id}", self.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(header::CONTENT_TYPE, "application/json");
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Sends a request and maps transport failures.
    async fn send(&self, request: reqwest::RequestBuilder) -> ProviderResult<Response> {
        self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout {
                    message: e.to_string(),
                }
            } else {
                ProviderError::network(format!("Request failed: {e}"))
            }
        })
    }

    /// Turns a non-success status into a classified error.
    async fn check_status(response: Response, external_id: Option<&str>) -> ProviderResult<Response> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);

            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Authentication {
                message: format!("Provider rejected credentials ({status})"),
            });
        }

        if status == StatusCode::NOT_FOUND {
            if let Some(id) = external_id {
                return Err(ProviderError::NotFound {
                    external_id: id.to_string(),
                });
            }
        }

        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::api(status.as_u16(), body))
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
    }
}

#[async_trait]
impl ResourceProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports_abort(&self) -> bool {
        true
    }

    async fn create(&self, resource_type: &str, attributes: &Attributes) -> ProviderResult<CreateOutcome> {
        let url = self.collection_url(resource_type);
        trace!("POST {url}");

        let request = self.client.post(&url).json(&CreateRequest { attributes });
        let response = Self::check_status(self.send(request).await?, None).await?;
        let body: CreateResponse = Self::parse(response).await?;

        if body.id.is_empty() {
            return Err(ProviderError::InvalidResponse {
                message: String::from("Provider returned an empty id"),
            });
        }

        debug!("http: created {resource_type} {}", body.id);
        Ok(CreateOutcome {
            external_id: body.id,
            outputs: body.outputs,
        })
    }

    async fn update(
        &self,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
        changed: &[String],
    ) -> ProviderResult<Attributes> {
        let url = self.item_url(resource_type, external_id);
        trace!("PATCH {url}");

        let request = self.client.patch(&url).json(&UpdateRequest { attributes, changed });
        let response = Self::check_status(self.send(request).await?, Some(external_id)).await?;
        let body: UpdateResponse = Self::parse(response).await?;

        debug!("http: updated {resource_type} {external_id}");
        Ok(body.outputs)
    }

    async fn delete(&self, resource_type: &str, external_id: &str) -> ProviderResult<()> {
        let url = self.item_url(resource_type, external_id);
        trace!("DELETE {url}");

        let response = self.send(self.client.delete(&url)).await?;
        Self::check_status(response, Some(external_id)).await?;

        debug!("http: deleted {resource_type} {external_id}");
        Ok(())
    }
}
