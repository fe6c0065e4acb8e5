//! Signed HTTP transport and response parsing
//!
//! Every request carries the protocol headers and a shared-key signature;
//! failures are retried per the configured [`RetryPolicy`] before the
//! response (or transport error) surfaces. Batch responses are split into
//! per-operation sub-responses keyed by `Content-ID`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use once_cell::sync::Lazy;
use reqwest::Method;

use crate::auth::Account;
use crate::error::{STATUS_PRECONDITION_FAILED, TableError};
use crate::retry::RetryPolicy;

pub(crate) const DATA_SERVICE_VERSION: &str = "2.0;NetFx";
pub(crate) const STORAGE_VERSION: &str = "2011-08-18";
pub(crate) const CONTENT_TYPE_ATOM: &str = "application/atom+xml";

static MERGE: Lazy<Method> = Lazy::new(|| Method::from_bytes(b"MERGE").unwrap());

/// A parsed top-level response: status, case-insensitive headers, raw body.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: String,
}

impl RestResponse {
    pub fn new<K, V>(status: u16, headers: impl IntoIterator<Item = (K, V)>, body: impl Into<String>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.as_ref().to_lowercase(), value.into()))
                .collect(),
            body: body.into(),
        }
    }

    /// Look up a response header, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// True for any 2xx status.
    pub fn succeeded(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The protocol error carried by this response.
    pub fn error(&self) -> TableError {
        TableError::protocol(self.status, &self.body)
    }

    /// Raise the parsed protocol error for any non-success status.
    pub fn ensure_succeeded(&self) -> Result<(), TableError> {
        if self.succeeded() { Ok(()) } else { Err(self.error()) }
    }
}

/// One operation's embedded response within a batch response.
#[derive(Debug, Clone)]
pub struct OperationResponse {
    /// The `Content-ID` echoed from the request, i.e. the operation's queue
    /// index.
    pub content_id: Option<usize>,
    pub status: u16,
    headers: HashMap<String, String>,
    pub body: String,
}

impl OperationResponse {
    fn new<K, V>(status: u16, headers: impl IntoIterator<Item = (K, V)>, body: impl Into<String>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers: HashMap<String, String> = headers
            .into_iter()
            .map(|(name, value)| (name.as_ref().to_lowercase(), value.into()))
            .collect();
        let content_id = headers.get("content-id").and_then(|id| id.parse().ok());

        Self {
            content_id,
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn succeeded(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// True when this operation was rejected on its `If-Match` precondition.
    pub fn precondition_failed(&self) -> bool {
        self.status == STATUS_PRECONDITION_FAILED
    }

    pub fn error(&self) -> TableError {
        TableError::protocol(self.status, &self.body)
    }
}

/// A parsed batch response: the outer response plus the per-operation
/// sub-responses found in its multipart body.
#[derive(Debug, Clone)]
pub struct BatchResponse {
    pub status: u16,
    pub body: String,
    pub operations: Vec<OperationResponse>,
}

impl BatchResponse {
    /// Split a multipart batch response into per-operation responses.
    ///
    /// Sub-responses are delimited by boundary lines and recognized by their
    /// embedded HTTP status lines; each one's headers run until the first
    /// blank line and its body until the next boundary.
    pub fn parse(response: RestResponse) -> Result<Self, TableError> {
        let mut operations = Vec::new();

        if response.succeeded() {
            let mut lines = response.body.lines().peekable();

            while let Some(line) = lines.next() {
                if !line.starts_with("HTTP/") {
                    continue;
                }

                let status: u16 = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|code| code.parse().ok())
                    .ok_or_else(|| TableError::Batch(format!("malformed status line {line:?}")))?;

                let mut headers = Vec::new();
                for header_line in lines.by_ref() {
                    if header_line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = header_line.split_once(':') {
                        headers.push((name.trim().to_string(), value.trim().to_string()));
                    }
                }

                let mut body_lines: Vec<&str> = Vec::new();
                while let Some(peeked) = lines.peek() {
                    if peeked.starts_with("--") {
                        break;
                    }
                    body_lines.push(*peeked);
                    lines.next();
                }
                let body = body_lines.join("\n").trim().to_string();

                operations.push(OperationResponse::new(status, headers, body));
            }
        }

        Ok(Self {
            status: response.status,
            body: response.body,
            operations,
        })
    }

    /// True when the outer request and every operation succeeded.
    pub fn succeeded(&self) -> bool {
        (200..300).contains(&self.status) && self.operations.iter().all(|op| op.succeeded())
    }

    /// The sub-response whose precondition failed, if any.
    pub fn failed_precondition(&self) -> Option<&OperationResponse> {
        self.operations.iter().find(|op| op.precondition_failed())
    }

    /// Raise the outer error, or the first failing operation's error.
    pub fn ensure_succeeded(&self) -> Result<(), TableError> {
        if !(200..300).contains(&self.status) {
            return Err(TableError::protocol(self.status, &self.body));
        }

        match self.operations.iter().find(|op| !op.succeeded()) {
            Some(failed) => Err(failed.error()),
            None => Ok(()),
        }
    }
}

/// The signed-transport seam the orchestration layers talk through.
///
/// The production implementation is [`RestClient`]; tests drive the
/// orchestrator through a scripted mock.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn get(&self, resource: &str, query: Option<&str>) -> Result<RestResponse, TableError>;
    async fn post(&self, resource: &str, content: &str) -> Result<RestResponse, TableError>;
    async fn put(&self, resource: &str, content: &str, if_match: Option<&str>)
    -> Result<RestResponse, TableError>;
    async fn merge(&self, resource: &str, content: &str, if_match: Option<&str>)
    -> Result<RestResponse, TableError>;
    async fn delete(&self, resource: &str, if_match: Option<&str>) -> Result<RestResponse, TableError>;
    async fn batch(&self, boundary: &str, content: Vec<u8>) -> Result<BatchResponse, TableError>;

    /// The absolute URL for a resource, without a query string. Batch
    /// encoding embeds these in sub-request status lines.
    fn format_url(&self, resource: &str) -> String;

    fn account_name(&self) -> &str;
    fn is_development_storage(&self) -> bool;
}

/// Signed HTTP client for the table service.
pub struct RestClient {
    http: reqwest::Client,
    account: Account,
    use_ssl: bool,
    retry: Arc<dyn RetryPolicy>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("account", &self.account)
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

impl RestClient {
    pub fn new(account: Account, use_ssl: bool, retry: Arc<dyn RetryPolicy>) -> Self {
        Self {
            http: reqwest::Client::new(),
            account,
            use_ssl,
            retry,
        }
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    fn format_url_with_query(&self, resource: &str, query: Option<&str>) -> String {
        let url = self.format_url(resource);
        match query {
            Some(query) if !query.is_empty() => format!("{url}?{query}"),
            _ => url,
        }
    }

    /// The URL path that participates in the canonicalized resource string.
    fn resource_path(&self, resource: &str) -> String {
        if self.account.is_development_storage() {
            format!("/{}/{}", self.account.name(), resource)
        } else {
            format!("/{resource}")
        }
    }

    /// The current time formatted for the `x-ms-date` header (RFC1123 UTC).
    fn x_ms_date() -> String {
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    async fn request(
        &self,
        method: Method,
        resource: &str,
        query: Option<&str>,
        content_type: Option<&str>,
        content: Option<Vec<u8>>,
        if_match: Option<&str>,
    ) -> Result<RestResponse, TableError> {
        let mut delays = self.retry.delays().into_iter();

        loop {
            match self
                .attempt(method.clone(), resource, query, content_type, content.clone(), if_match)
                .await
            {
                Ok(response) => {
                    if response.succeeded() {
                        return Ok(response);
                    }

                    let error = response.error();
                    // a stale ETag is a correctness signal for the caller,
                    // never a transient fault
                    if !error.is_precondition_failure() && self.retry.should_retry(&error) {
                        if let Some(delay) = delays.next() {
                            warn!("retrying {method} {resource} after {delay:?}: {error}");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }

                    // the caller decides whether a failed response is an error
                    return Ok(response);
                }
                Err(error) => {
                    if self.retry.should_retry(&error) {
                        if let Some(delay) = delays.next() {
                            warn!("retrying {method} {resource} after {delay:?}: {error}");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }

                    return Err(error);
                }
            }
        }
    }

    async fn attempt(
        &self,
        method: Method,
        resource: &str,
        query: Option<&str>,
        content_type: Option<&str>,
        content: Option<Vec<u8>>,
        if_match: Option<&str>,
    ) -> Result<RestResponse, TableError> {
        let url = self.format_url_with_query(resource, query);
        let date = Self::x_ms_date();
        let content_type = content_type.unwrap_or(CONTENT_TYPE_ATOM);
        let authorization = self.account.sign(
            method.as_str(),
            "",
            content_type,
            &date,
            &self.resource_path(resource),
        );

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", content_type)
            .header("DataServiceVersion", DATA_SERVICE_VERSION)
            .header("MaxDataServiceVersion", DATA_SERVICE_VERSION)
            .header("x-ms-date", date)
            .header("x-ms-version", STORAGE_VERSION)
            .header("Authorization", authorization);

        if let Some(if_match) = if_match {
            request = request.header("If-Match", if_match);
        }
        if let Some(content) = content {
            request = request.body(content);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.text().await?;

        debug!("{method} {url} -> {status}");

        Ok(RestResponse::new(status, headers, body))
    }
}

#[async_trait]
impl RestApi for RestClient {
    async fn get(&self, resource: &str, query: Option<&str>) -> Result<RestResponse, TableError> {
        self.request(Method::GET, resource, query, None, None, None).await
    }

    async fn post(&self, resource: &str, content: &str) -> Result<RestResponse, TableError> {
        self.request(
            Method::POST,
            resource,
            None,
            None,
            Some(content.as_bytes().to_vec()),
            None,
        )
        .await
    }

    async fn put(
        &self,
        resource: &str,
        content: &str,
        if_match: Option<&str>,
    ) -> Result<RestResponse, TableError> {
        self.request(
            Method::PUT,
            resource,
            None,
            None,
            Some(content.as_bytes().to_vec()),
            if_match,
        )
        .await
    }

    async fn merge(
        &self,
        resource: &str,
        content: &str,
        if_match: Option<&str>,
    ) -> Result<RestResponse, TableError> {
        self.request(
            MERGE.clone(),
            resource,
            None,
            None,
            Some(content.as_bytes().to_vec()),
            if_match,
        )
        .await
    }

    async fn delete(&self, resource: &str, if_match: Option<&str>) -> Result<RestResponse, TableError> {
        self.request(Method::DELETE, resource, None, None, None, if_match).await
    }

    async fn batch(&self, boundary: &str, content: Vec<u8>) -> Result<BatchResponse, TableError> {
        let content_type = format!("multipart/mixed; boundary={boundary}");
        let response = self
            .request(Method::POST, "$batch", None, Some(&content_type), Some(content), None)
            .await?;

        BatchResponse::parse(response)
    }

    fn format_url(&self, resource: &str) -> String {
        if self.account.is_development_storage() {
            // fixed local-emulator address
            format!("http://127.0.0.1:10002/{}/{}", self.account.name(), resource)
        } else {
            let protocol = if self.use_ssl { "https" } else { "http" };
            format!(
                "{}://{}.table.core.windows.net/{}",
                protocol,
                self.account.name(),
                resource
            )
        }
    }

    fn account_name(&self) -> &str {
        self.account.name()
    }

    fn is_development_storage(&self) -> bool {
        self.account.is_development_storage()
    }
}
