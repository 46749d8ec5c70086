//! Collaborator contract for performing HTTP fetches, plus the default
//! `reqwest`-backed adapter (the teacher's own HTTP stack). See spec §4.11.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Request, Response};

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Pluggable fetch contract. The default is [`ReqwestHttpClient`]; tests
/// substitute mocks that never touch the network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, HttpClientError>;
}

/// Default adapter built on `reqwest`, matching the teacher's client setup
/// (tls feature selection lives in Cargo.toml; this just wires headers,
/// timeouts, and redirect policy).
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new(user_agent: &str, follow_redirects: bool, default_timeout: Duration) -> Result<Self, HttpClientError> {
        let redirect_policy = if follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy)
            .build()
            .map_err(|source| HttpClientError::Transport {
                url: String::new(),
                source,
            })?;

        Ok(Self {
            client,
            default_timeout,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn fetch(&self, request: Request) -> Result<Response, HttpClientError> {
        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut builder = self
            .client
            .request(
                request.method.parse().unwrap_or(reqwest::Method::GET),
                &request.url,
            )
            .timeout(timeout);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|source| {
            if source.is_timeout() {
                HttpClientError::Timeout {
                    url: request.url.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                HttpClientError::Transport {
                    url: request.url.clone(),
                    source,
                }
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect::<HashMap<_, _>>();

        let body = response
            .bytes()
            .await
            .map_err(|source| HttpClientError::Transport {
                url: request.url.clone(),
                source,
            })?
            .to_vec();

        Ok(Response {
            status,
            headers,
            body,
            url: request.url,
        })
    }
}
