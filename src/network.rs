use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::Error;

/// Download chunk size written per call.
const CHUNK: usize = 1024;
const BACKOFF_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            body: RequestBody::Json(body),
            ..Self::get(url)
        }
    }

    pub fn post_form(url: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            method: Method::POST,
            body: RequestBody::Form(fields),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }

    /// Replaces any previous `Authorization` header.
    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
        self.header("Authorization", format!("Bearer {token}"))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body)
            .map_err(|err| Error::Unknown(format!("malformed JSON response: {err}")))
    }

    /// Turns a non-2xx answer into an [`Error::Http`].
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::Http {
                status: self.status,
                message: truncate(&self.text(), 200),
            })
        }
    }
}

/// Outcome of streaming a response body into a file.
#[derive(Debug, Clone)]
pub struct Download {
    pub status: u16,
    pub bytes: u64,
    /// Body text of a failed request.
    pub error_body: Option<String>,
}

impl Download {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Shared HTTP client with the service's timeout and retry policy.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retries: u32,
}

impl HttpClient {
    pub fn new(cfg: &HttpConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(cfg.timeout)
            .connect_timeout(Duration::from_secs(30))
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            retries: cfg.retries.max(1),
        })
    }

    /// `retries` counts the attempts after the first one.
    fn gives_up(&self, attempt: u32) -> bool {
        attempt > self.retries
    }

    fn build(&self, req: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(req.method.clone(), &req.url);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        for (key, value) in &req.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        match &req.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        }
    }

    async fn execute(&self, req: &ApiRequest) -> Result<reqwest::Response, Error> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.build(req).send().await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let err = Error::from(err);
                    let transient = matches!(err, Error::NoNetwork(_) | Error::Timeout);
                    if !transient || self.gives_up(attempt) {
                        return Err(err);
                    }
                    let pause = BACKOFF_STEP * attempt;
                    warn!(url = %req.url, attempt, error = %err, ?pause, "request failed; retrying");
                    sleep(pause).await;
                }
            }
        }
    }

    pub async fn send(&self, req: &ApiRequest) -> Result<HttpResponse, Error> {
        let response = self.execute(req).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        debug!(url = %req.url, status, bytes = body.len(), "request finished");
        Ok(HttpResponse { status, body })
    }

    /// Streams the body into `dest`; the file only appears on success.
    pub async fn download(&self, req: &ApiRequest, dest: &Path) -> Result<Download, Error> {
        let response = self.execute(req).await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Ok(Download {
                status,
                bytes: 0,
                error_body: Some(truncate(&text, 500)),
            });
        }

        let partial = dest.with_extension("part");
        let written = match write_body(response, &partial).await {
            Ok(written) => written,
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %partial.display(), error = %cleanup, "failed to remove partial download");
                    }
                }
                return Err(err);
            }
        };
        tokio::fs::rename(&partial, dest)
            .await
            .map_err(|err| Error::FailedSaving(format!("{}: {err}", dest.display())))?;
        debug!(url = %req.url, bytes = written, "download finished");
        Ok(Download {
            status,
            bytes: written,
            error_body: None,
        })
    }
}

async fn write_body(response: reqwest::Response, partial: &Path) -> Result<u64, Error> {
    let saving = |err: std::io::Error| Error::FailedSaving(format!("{}: {err}", partial.display()));
    let mut file = File::create(partial).await.map_err(saving)?;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for piece in chunk.chunks(CHUNK) {
            file.write_all(piece).await.map_err(saving)?;
            written += piece.len() as u64;
        }
    }
    file.flush().await.map_err(saving)?;
    Ok(written)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
