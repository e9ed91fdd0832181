use std::sync::Arc;

use reqwest::{header, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::snapshots::codec::{self, DecodeStats};
use crate::types::{Category, MemberRecord};
use crate::upstream::{RateLimiter, TokenBroker};

#[derive(Debug, Default)]
pub struct FetchStats {
    pub rows: usize,
    pub skipped: usize,
    pub kept: usize,
    /// Whether the CSV came from a signed link rather than the data response.
    pub via_link: bool,
    /// (line, reason) for a few rejected rows.
    pub rejection_samples: Vec<(u64, String)>,
}

impl FetchStats {
    fn from_decode(stats: DecodeStats, kept: usize, via_link: bool) -> Self {
        Self {
            rows: stats.rows,
            skipped: stats.skipped,
            kept,
            via_link,
            rejection_samples: stats.rejection_samples,
        }
    }
}

#[derive(Debug)]
pub struct FetchedRoster {
    pub records: Vec<MemberRecord>,
    pub stats: FetchStats,
}

#[derive(Debug, Deserialize)]
struct DataLink {
    link: Option<String>,
}

/// Which leg of the 401 protocol a request belongs to. At most one
/// re-authentication happens per fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Reauthorized,
}

pub struct UpstreamFetcher {
    http: reqwest::Client,
    broker: Arc<TokenBroker>,
    limiter: Arc<RateLimiter>,
    data_url_template: String,
}

impl UpstreamFetcher {
    pub fn new(
        http: reqwest::Client,
        broker: Arc<TokenBroker>,
        limiter: Arc<RateLimiter>,
        data_url_template: impl Into<String>,
    ) -> Self {
        Self {
            http,
            broker,
            limiter,
            data_url_template: data_url_template.into(),
        }
    }

    pub fn broker(&self) -> &Arc<TokenBroker> {
        &self.broker
    }

    fn data_url(&self, category: &Category) -> String {
        self.data_url_template.replace("{category}", category.as_str())
    }

    /// Downloads the full roster for `category`. Every decodable row is
    /// returned; only a roster with no surviving rows is an error.
    pub async fn fetch_category(&self, category: &Category) -> Result<FetchedRoster> {
        let url = self.data_url(category);
        let response = self.get_authorized(&url).await?;

        let is_json = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Upstream(format!("reading data response failed: {e}")))?;

        let (csv, via_link) = if is_json || body.first() == Some(&b'{') {
            let link: DataLink = serde_json::from_slice(&body)
                .map_err(|e| AppError::Upstream(format!("unexpected data response: {e}")))?;
            let link = link
                .link
                .ok_or_else(|| AppError::Upstream("data response carried no link".to_string()))?;
            (self.download_link(&link).await?, true)
        } else {
            (body.to_vec(), false)
        };

        let (records, stats) = tokio::task::spawn_blocking(move || codec::decode(&csv)).await??;
        let stats = FetchStats::from_decode(stats, records.len(), via_link);

        for (line, reason) in &stats.rejection_samples {
            warn!(category = %category, line, "Skipped roster row: {reason}");
        }
        if records.is_empty() {
            return Err(AppError::Parse(format!(
                "no usable rows in {category} roster ({} rows, {} skipped)",
                stats.rows, stats.skipped
            )));
        }

        info!(
            category = %category,
            rows = stats.rows,
            kept = stats.kept,
            skipped = stats.skipped,
            via_link = stats.via_link,
            "Fetched roster"
        );
        Ok(FetchedRoster { records, stats })
    }

    /// GET with a bearer token. A 401 triggers one re-authentication and
    /// one retry; a second 401 is an authentication failure.
    async fn get_authorized(&self, url: &str) -> Result<reqwest::Response> {
        let mut attempt = Attempt::First;
        loop {
            self.limiter.acquire().await?;
            let authorized = self.broker.authorize(self.http.get(url)).await?;
            let response = authorized
                .request
                .send()
                .await
                .map_err(|e| AppError::Upstream(format!("request to data endpoint failed: {e}")))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                match attempt {
                    Attempt::First => {
                        debug!(generation = authorized.generation, "Data endpoint answered 401");
                        self.broker.on_unauthorized(authorized.generation).await?;
                        attempt = Attempt::Reauthorized;
                        continue;
                    }
                    Attempt::Reauthorized => {
                        return Err(AppError::Auth(
                            "data endpoint rejected a freshly renewed token".to_string(),
                        ));
                    }
                }
            }
            if !status.is_success() {
                return Err(AppError::Upstream(format!("data endpoint returned {status}")));
            }
            return Ok(response);
        }
    }

    /// Signed links are fetched without the bearer header.
    async fn download_link(&self, link: &str) -> Result<Vec<u8>> {
        self.limiter.acquire().await?;
        let response = self
            .http
            .get(link)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("roster download failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!("roster link returned {status}")));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Upstream(format!("reading roster download failed: {e}")))?;
        Ok(body.to_vec())
    }
}
