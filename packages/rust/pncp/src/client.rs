//! Retried, paginated HTTP access to the PNCP consultation API.

use std::time::Duration;

use licitai_shared::{LicitaiError, PncpConfig, Result, RetryPolicy};
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

/// User-Agent string for PNCP requests.
const USER_AGENT: &str = concat!("Licitai/", env!("CARGO_PKG_VERSION"));

/// Longest error body excerpt kept in a `PermanentRequest` message.
const MAX_ERROR_BODY: usize = 300;

/// Query parameters sent with a request, in order.
pub type Filters = Vec<(&'static str, String)>;

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub data: Vec<T>,
    /// Total items across all pages, when the server reports it.
    pub count: Option<u64>,
}

impl<T> Page<T> {
    /// The page a `204 No Content` response stands for.
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            count: Some(0),
        }
    }
}

#[derive(Deserialize)]
struct RawPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default, alias = "totalRegistros")]
    count: Option<u64>,
}

// ---------------------------------------------------------------------------
// PncpClient
// ---------------------------------------------------------------------------

/// HTTP client for PNCP with error classification and a retry budget.
///
/// Transient failures (timeouts, connection errors, 5xx, 429, bodies that
/// are not JSON) are retried under [`RetryPolicy`]. Other 4xx responses fail
/// on the first attempt.
#[derive(Debug, Clone)]
pub struct PncpClient {
    http: Client,
    base_url: String,
    page_size: u32,
    retry: RetryPolicy,
}

impl PncpClient {
    pub fn new(config: &PncpConfig, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LicitaiError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.max(1),
            retry,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch page `page` (1-based) of `endpoint`.
    #[instrument(skip_all, fields(endpoint = endpoint, page = page))]
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        filters: &[(&'static str, String)],
        page: u32,
    ) -> Result<Page<T>> {
        let mut query: Filters = filters.to_vec();
        query.push(("pagina", page.to_string()));
        query.push(("tamanhoPagina", self.page_size.to_string()));

        let raw: Option<RawPage<T>> = self.get_json(endpoint, &query).await?;
        Ok(match raw {
            Some(raw) => Page {
                data: raw.data,
                count: raw.count,
            },
            None => Page::empty(),
        })
    }

    /// Fetch every page of `endpoint`, concatenated in arrival order.
    ///
    /// Stops on an empty page, a short page, or once the reported count is
    /// reached. Any page failure fails the whole fetch.
    #[instrument(skip_all, fields(endpoint = endpoint))]
    pub async fn fetch_all<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        filters: &[(&'static str, String)],
    ) -> Result<Vec<T>> {
        let page_size = self.page_size as usize;
        let mut items: Vec<T> = Vec::new();
        let mut page = 1u32;

        loop {
            let Page { data, count } = self.fetch_page::<T>(endpoint, filters, page).await?;
            let received = data.len();
            items.extend(data);

            debug!(page, received, total = items.len(), reported = ?count, "page fetched");

            let reached_count = count.is_some_and(|c| items.len() as u64 >= c);
            if received == 0 || received < page_size || reached_count {
                break;
            }
            page += 1;
        }

        Ok(items)
    }

    /// GET a single JSON document. `Ok(None)` for 404 and 204.
    pub async fn fetch_one<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Option<T>> {
        match self.get_json::<T>(endpoint, &[]).await {
            Err(LicitaiError::PermanentRequest { status: 404, .. }) => Ok(None),
            other => other,
        }
    }

    /// GET with retries. `Ok(None)` on 204.
    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&'static str, String)],
    ) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.attempt::<T>(&url, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        %url,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(LicitaiError::FetchFailed {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request, classified.
    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&'static str, String)],
    ) -> Result<Option<T>> {
        let response = self
            .http
            .get(url)
            .query(query)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| LicitaiError::Transient(format!("{url}: {e}")))?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(LicitaiError::Transient(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(LicitaiError::PermanentRequest {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| LicitaiError::Transient(format!("{url}: body read failed: {e}")))?;

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| LicitaiError::Transient(format!("{url}: malformed response: {e}")))
    }
}
