//! HTTP fetching for polled feeds.
//!
//! Some providers only offer pull endpoints. [`RatedClient`] front-ends any
//! [`HttpClient`] with a [`QueueingRateLimiter`] so outbound polling stays
//! inside the provider's rate limit: a burst of requests goes straight
//! through, the rest queue and execute in FIFO order at the steady rate.

use crate::rate_limit::QueueingRateLimiter;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Request, Response};
use std::time::Duration;

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

/// Plain reqwest client with conservative timeouts.
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        self.0.execute(req).await
    }
}

/// Wraps a client so every request first waits for a rate-limiter slot.
pub struct RatedClient<C> {
    inner: C,
    limiter: QueueingRateLimiter,
}

impl<C> RatedClient<C> {
    pub fn new(inner: C, burst: usize, requests_per_second: f64) -> Self {
        Self {
            inner,
            limiter: QueueingRateLimiter::new(burst, requests_per_second),
        }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for RatedClient<C> {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        // Resolves immediately while burst capacity lasts, later otherwise.
        self.limiter.queue(|| {}).await;
        self.inner.execute(req).await
    }
}

pub async fn fetch_bytes<C: HttpClient>(client: &C, url: &str) -> Result<Bytes> {
    let req = Request::new(Method::GET, url.parse()?);
    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?)
}
