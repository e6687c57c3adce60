// ABOUTME: HTTP client for the Elasticsearch-compatible destination
// ABOUTME: Implements health, refresh and top-watermark lookups plus single-document indexing

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::request::{check_refresh, is_index_not_found, parse_health, TopWatermarkQuery};
use crate::watermark::spec::{HealthStatus, IndexName};
use crate::watermark::{IndexPresence, TopHit, WatermarkStore};

const DIAGNOSTIC_TARGET: &str = "watermark_sync::destination";

/// Connection settings for the destination.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub endpoint: Url,
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Log every request and response body.
    pub debug: bool,
}

#[derive(Clone)]
pub struct ElasticsearchClient {
    client: Client,
    endpoint: Url,
    username: Option<String>,
    password: Option<String>,
    debug: bool,
}

impl ElasticsearchClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: options.endpoint,
            username: options.username,
            password: options.password,
            debug: options.debug,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Build a URL from path segments, each percent-encoded individually.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("endpoint {} cannot be a base URL", self.endpoint))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_deref()),
            None => request,
        }
    }

    /// Send a request and return the status with the parsed JSON body
    /// (`Value::Null` if the body is empty or not JSON).
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<(StatusCode, Value)> {
        let url = self.url(segments)?;
        if self.debug {
            tracing::info!(
                target: DIAGNOSTIC_TARGET,
                "{} {} {}",
                method,
                url,
                body.map(|b| b.to_string()).unwrap_or_default()
            );
        }

        let mut request = self.request(method.clone(), url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;

        if self.debug {
            tracing::info!(target: DIAGNOSTIC_TARGET, "{} {} -> {} {}", method, url, status, text);
        }

        let parsed = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, parsed))
    }

    /// Index one document. With an id the write is an overwrite, so a
    /// redelivered event replaces its earlier copy.
    pub async fn index_document(
        &self,
        index: &IndexName,
        id: Option<&str>,
        document: &Value,
    ) -> Result<()> {
        let (status, body) = match id {
            Some(id) => {
                self.send(Method::PUT, &[index.as_str(), "_doc", id], Some(document))
                    .await?
            }
            None => {
                self.send(Method::POST, &[index.as_str(), "_doc"], Some(document))
                    .await?
            }
        };

        if !status.is_success() {
            bail!(
                "Indexing into {} failed with status {}: {}",
                index,
                status,
                body
            );
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for ElasticsearchClient {
    async fn health(&self) -> Result<HealthStatus> {
        let (status, body) = self
            .send(Method::GET, &["_cluster", "health"], None)
            .await?;
        // A red cluster answers 503 with a normal health body.
        if !status.is_success() && body.get("status").is_none() {
            bail!("Health check failed with status {}: {}", status, body);
        }
        parse_health(&body)
    }

    async fn refresh(&self, index: &IndexName) -> Result<IndexPresence> {
        let (status, body) = self
            .send(Method::POST, &[index.as_str(), "_refresh"], None)
            .await?;

        if status == StatusCode::NOT_FOUND {
            if is_index_not_found(&body) || body.is_null() {
                return Ok(IndexPresence::Missing);
            }
            bail!("Refresh of {} returned 404: {}", index, body);
        }
        if !status.is_success() {
            bail!("Refresh of {} failed with status {}: {}", index, status, body);
        }
        check_refresh(&body).with_context(|| format!("Refresh of {} incomplete", index))?;
        Ok(IndexPresence::Present)
    }

    async fn top_watermark(&self, query: &TopWatermarkQuery) -> Result<TopHit> {
        let request_body = query.to_body();
        let (status, body) = self
            .send(
                Method::POST,
                &[query.index.as_str(), "_search"],
                Some(&request_body),
            )
            .await?;

        if status == StatusCode::NOT_FOUND && is_index_not_found(&body) {
            return Ok(TopHit::IndexMissing);
        }
        if !status.is_success() {
            bail!(
                "Watermark query on {} failed with status {}: {}",
                query.index,
                status,
                body
            );
        }
        query.parse_response(&body)
    }
}
