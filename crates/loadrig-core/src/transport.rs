use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        let mut request = Self::new(Method::Post, url);
        request.body = Some(body.into());
        request
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub duration: Duration,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    /// Lenient body parse; `None` when the body is not JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_str(&self.body).ok()
    }
}

pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HttpResponse, TransportError>> + Send + 'a>>;

/// HTTP capability the engine drives requests through. Connection pooling,
/// TLS and redirects live behind this seam, not in the core.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn request<'a>(&'a self, req: &'a HttpRequest) -> TransportFuture<'a>;
}

/// Mock transport for tests and dry runs: fixed delay, canned body, 200 for
/// reads and 201 for creates.
pub struct MockTransport {
    delay: Duration,
    body: String,
}

impl MockTransport {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            body: "{}".to_string(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn request<'a>(&'a self, req: &'a HttpRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            sleep(self.delay).await;

            let status = match req.method {
                Method::Post => 201,
                _ => 200,
            };
            Ok(HttpResponse {
                status,
                headers: Vec::new(),
                body: self.body.clone(),
                duration: self.delay,
            })
        })
    }
}

/// Real HTTP transport backed by a pooled reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn request<'a>(&'a self, req: &'a HttpRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            let start = Instant::now();

            let mut builder = match req.method {
                Method::Get => self.client.get(&req.url),
                Method::Post => self.client.post(&req.url),
                Method::Put => self.client.put(&req.url),
                Method::Delete => self.client.delete(&req.url),
            };
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }

            match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let headers = response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.to_string(),
                                String::from_utf8_lossy(value.as_bytes()).into_owned(),
                            )
                        })
                        .collect();
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(err) => return Err(TransportError::Request(err.to_string())),
                    };
                    Ok(HttpResponse {
                        status,
                        headers,
                        body,
                        duration: start.elapsed(),
                    })
                }
                Err(err) if err.is_timeout() => Err(TransportError::Timeout),
                Err(err) => Err(TransportError::Request(err.to_string())),
            }
        })
    }
}
