//! Durable store client (tier 3, system of record).
//!
//! The backing API lives in the host application:
//! - `POST {base}/api/v1/documents/public/{name}/sync` with `{content, xmlContent}`
//! - `GET  {base}/api/v1/documents/public/{name}` returning at least `{content}`

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Materialized document views pushed to the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentContent {
    pub content: String,
    #[serde(default)]
    pub xml_content: String,
}

#[derive(Debug, Deserialize)]
struct StoredDocument {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Persist the final content of a document. Any non-success status is
    /// an error.
    async fn push(&self, name: &str, content: &DocumentContent) -> Result<(), StoreError>;

    /// Stored text content of a document, or None if the store has none.
    async fn fetch(&self, name: &str) -> Result<Option<String>, StoreError>;
}

/// HTTP client for the host application's document API.
#[derive(Clone)]
pub struct HttpDurableStore {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpDurableStore {
    pub fn new(base_url: &str, api_token: Option<String>) -> Result<Self, StoreError> {
        let base_url = Url::parse(base_url).map_err(|e| StoreError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl {
                url: base_url.to_string(),
                reason: "not a base URL".to_string(),
            });
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            api_token,
        })
    }

    /// `{base}/api/v1/documents/public/{name}[/sync]`, with `name` escaped
    /// as a single path segment.
    fn document_url(&self, name: &str, sync: bool) -> Result<Url, StoreError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| StoreError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a base URL".to_string(),
            })?;
            segments
                .pop_if_empty()
                .extend(["api", "v1", "documents", "public", name]);
            if sync {
                segments.push("sync");
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl DurableStore for HttpDurableStore {
    async fn push(&self, name: &str, content: &DocumentContent) -> Result<(), StoreError> {
        let url = self.document_url(name, true)?;
        let response = self
            .authorize(self.client.post(url))
            .json(content)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Rejected {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }
        log::debug!("Pushed {name} to durable store ({} bytes)", content.content.len());
        Ok(())
    }

    async fn fetch(&self, name: &str) -> Result<Option<String>, StoreError> {
        let url = self.document_url(name, false)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Rejected {
                name: name.to_string(),
                status: status.as_u16(),
            });
        }
        let stored: StoredDocument = response.json().await?;
        Ok(stored.content)
    }
}
