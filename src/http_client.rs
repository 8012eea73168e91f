//! HTTP client abstraction for talking to the inference backend.
//!
//! This module provides a trait-based abstraction over HTTP clients, enabling
//! dependency injection and easy mocking in tests. Transport failures are
//! reduced to the few kinds the retry and probe logic cares about.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// A completed HTTP exchange: status code and body text.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure to obtain any HTTP response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("{0}")]
    Other(String),
}

/// Trait for HTTP communication with the backend.
///
/// This abstraction allows injecting mock HTTP clients for testing without
/// making real network requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request, giving up after `timeout`.
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError>;

    /// Sends a POST request with a JSON body, giving up after `timeout`.
    ///
    /// Non-2xx statuses are returned as responses, not errors.
    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// HTTP client implementation using reqwest.
///
/// This is the default production implementation that makes real HTTP requests.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::ConnectionRefused
    } else {
        TransportError::Other(err.to_string())
    }
}

async fn into_response(response: reqwest::Response) -> Result<HttpResponse, TransportError> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(classify)?;
    Ok(HttpResponse { status, body })
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;
        into_response(response).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(classify)?;
        into_response(response).await
    }
}
