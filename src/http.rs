use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use reqwest::{Client, header::{HeaderMap, HeaderName, HeaderValue}};
use std::time::Duration;
use url::Url;

/// 一次GET请求的结果
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Final URL after redirects; relative playlist entries resolve against it.
    pub url: Url,
    pub body: Bytes,
}

/// Minimal HTTP surface the fetcher needs: `GET url -> bytes`.
///
/// Non-2xx responses, timeouts and transport failures are all errors.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Fetched>;
}

#[async_trait]
impl Fetch for Client {
    async fn get(&self, url: &Url) -> Result<Fetched> {
        let response = Client::get(self, url.clone()).send().await?.error_for_status()?;
        let final_url = response.url().clone();
        let body = response.bytes().await?;
        Ok(Fetched { url: final_url, body })
    }
}

/// 构建HTTP客户端，包含自定义请求头
pub fn build_http_client(custom_headers: &[String], timeout: Duration) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36")
    );

    for header in custom_headers {
        if let Some((key, value)) = header.split_once(':') {
            let header_name = HeaderName::from_bytes(key.trim().as_bytes())?;
            let header_value = HeaderValue::from_str(value.trim())?;
            headers.insert(header_name, header_value);
        } else {
            warn!("Ignoring malformed header: {}", header);
        }
    }

    debug!("Using {} HTTP headers", headers.len());

    let client = Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()?;

    Ok(client)
}
