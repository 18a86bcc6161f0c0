use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONNECTION};

use crate::error::{Error, Result};

/// Outcome of a single attempt, before success/failure classification.
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

/// The HTTP transport the Fetch Executor drives. Abstracted so the retry
/// loop can be exercised with a scripted double instead of real sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn get(
        &self,
        url: &str,
        proxy_connect_url: Option<&str>,
        connect_timeout: Duration,
        request_timeout: Duration,
        user_agent: &str,
        max_content_length: u64,
    ) -> Result<TransportResponse>;
}

/// Real transport, built on `reqwest`. A fresh client is built per attempt
/// since the proxy (or lack of one) is chosen per attempt.
pub struct ReqwestTransport;

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        proxy_connect_url: Option<&str>,
        connect_timeout: Duration,
        request_timeout: Duration,
        user_agent: &str,
        max_content_length: u64,
    ) -> Result<TransportResponse> {
        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .gzip(true)
            .brotli(true)
            .deflate(true);

        let used_proxy = proxy_connect_url.is_some();

        builder = match proxy_connect_url {
            Some(connect_url) => {
                let proxy = reqwest::Proxy::all(connect_url)
                    .map_err(|e| Error::InvalidProxyAddress(e.to_string()))?;
                builder.proxy(proxy)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(Error::Http)?;

        let response = client
            .get(url)
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            )
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(CONNECTION, "keep-alive")
            .header(CACHE_CONTROL, "max-age=0")
            .send()
            .await
            .map_err(|e| classify(e, used_proxy))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::DecodeError(e.to_string()))?;

        if body.len() as u64 > max_content_length {
            return Err(Error::DecodeError(format!(
                "response body of {} bytes exceeds max_content_length_bytes ({})",
                body.len(),
                max_content_length
            )));
        }

        Ok(TransportResponse { status, body })
    }
}

fn classify(err: reqwest::Error, used_proxy: bool) -> Error {
    if err.is_timeout() {
        Error::Timeout(Duration::from_secs(0))
    } else if err.is_connect() {
        if used_proxy {
            Error::ProxyError(err.to_string())
        } else {
            Error::ConnectionError(err.to_string())
        }
    } else {
        Error::Http(err)
    }
}
