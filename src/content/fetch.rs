use anyhow::{Context, Result};
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::time::Duration;
use tokio::time::timeout;

/// Result of one article retrieval attempt. Retrieval problems are data,
/// not errors: the caller records them as a per-item verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { text: String },
    Failed { reason: String },
}

/// Retrieval seam for full article content.
pub trait ContentFetcher: Send + Sync {
    fn fetch<'a>(&'a self, link: &'a str) -> BoxFuture<'a, FetchOutcome>;
}

static CONTENT_SCOPE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("article, main").expect("static selector"));
static TEXT_BLOCKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p, h1, h2, h3").expect("static selector"));

/// Downloads a page and reduces it to readable text.
///
/// The whole operation, extraction included, runs under one overall
/// timeout. The fetcher never retries; transient failures surface as a
/// `Failed` outcome for the one item that hit them.
pub struct PageFetcher {
    http: reqwest::Client,
    overall_timeout: Duration,
}

impl PageFetcher {
    pub fn new(overall_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building the page fetch client")?;
        Ok(Self {
            http,
            overall_timeout,
        })
    }

    async fn fetch_inner(&self, link: &str) -> FetchOutcome {
        let response = match self.http.get(link).send().await {
            Ok(response) => response,
            Err(err) => {
                return FetchOutcome::Failed {
                    reason: format!("request failed: {err}"),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return FetchOutcome::Failed {
                reason: format!("HTTP {}", status.as_u16()),
            };
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                return FetchOutcome::Failed {
                    reason: format!("body read failed: {err}"),
                }
            }
        };

        // HTML parsing is CPU work; keep it off the async threads.
        let text = match tokio::task::spawn_blocking(move || extract_text(&body)).await {
            Ok(text) => text,
            Err(_) => {
                return FetchOutcome::Failed {
                    reason: "text extraction failed".to_string(),
                }
            }
        };

        if text.trim().is_empty() {
            return FetchOutcome::Failed {
                reason: "no readable text".to_string(),
            };
        }

        FetchOutcome::Success { text }
    }
}

impl ContentFetcher for PageFetcher {
    fn fetch<'a>(&'a self, link: &'a str) -> BoxFuture<'a, FetchOutcome> {
        Box::pin(async move {
            match timeout(self.overall_timeout, self.fetch_inner(link)).await {
                Ok(outcome) => outcome,
                Err(_) => FetchOutcome::Failed {
                    reason: format!("timed out after {:?}", self.overall_timeout),
                },
            }
        })
    }
}

/// Pulls paragraph and heading text out of the page, preferring a dedicated
/// `article`/`main` region over the whole body.
fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root = document
        .select(&CONTENT_SCOPE)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut parts = Vec::new();
    for block in root.select(&TEXT_BLOCKS) {
        let text = block.text().collect::<String>();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !text.is_empty() {
            parts.push(text);
        }
    }
    parts.join("\n\n")
}
