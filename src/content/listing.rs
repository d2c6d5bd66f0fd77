use crate::pipeline::candidate::{Candidate, CandidateBatch};
use crate::runtime::config::{ListingPage, ListingSelectors};
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use scraper::{Html, Selector};
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

/// Pull-based producer of candidate batches. The engine asks for the next
/// batch only once it has capacity for it.
pub trait CandidateSource: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<CandidateBatch>>>;
}

/// Scrapes configured listing pages, yielding one batch per page.
///
/// A page that fails to download or parse is logged and skipped; one broken
/// source should not end a run that has other pages to offer.
pub struct ListingSource {
    http: reqwest::Client,
    pages: VecDeque<ListingPage>,
}

impl ListingSource {
    pub fn new(pages: Vec<ListingPage>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("building the listing page client")?;
        Ok(Self {
            http,
            pages: pages.into(),
        })
    }

    async fn scrape_page(&self, page: &ListingPage) -> Result<CandidateBatch> {
        let body = self
            .http
            .get(&page.url)
            .send()
            .await
            .with_context(|| format!("requesting {}", page.url))?
            .error_for_status()
            .with_context(|| format!("error status from {}", page.url))?
            .text()
            .await
            .with_context(|| format!("reading {}", page.url))?;

        let base =
            Url::parse(&page.url).with_context(|| format!("invalid page url {}", page.url))?;
        parse_listing(&body, &base, page)
    }
}

impl CandidateSource for ListingSource {
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<CandidateBatch>>> {
        Box::pin(async move {
            while let Some(page) = self.pages.pop_front() {
                match self.scrape_page(&page).await {
                    Ok(batch) => {
                        tracing::info!(
                            page = page.label.as_str(),
                            candidates = batch.len(),
                            "scraped listing page"
                        );
                        return Ok(Some(batch));
                    }
                    Err(err) => {
                        tracing::warn!(
                            page = page.label.as_str(),
                            error = %err,
                            "skipping unreadable listing page"
                        );
                    }
                }
            }
            Ok(None)
        })
    }
}

/// Extracts candidate rows from one listing page.
///
/// Rows missing a title or a resolvable link are skipped rather than
/// failing the page; listing markup is rarely uniform all the way down.
fn parse_listing(html: &str, base: &Url, page: &ListingPage) -> Result<CandidateBatch> {
    let selectors = CompiledSelectors::compile(&page.selectors)?;
    let document = Html::parse_document(html);

    let mut candidates = Vec::new();
    for row in document.select(&selectors.item) {
        let Some(title_elem) = row.select(&selectors.title).next() else {
            continue;
        };
        let title = collapse_whitespace(&title_elem.text().collect::<String>());
        if title.is_empty() {
            continue;
        }

        let Some(href) = row
            .select(&selectors.link)
            .next()
            .and_then(|elem| elem.value().attr("href"))
        else {
            continue;
        };
        let Some(link) = resolve_link(base, href) else {
            continue;
        };

        let summary = selectors
            .summary
            .as_ref()
            .and_then(|selector| row.select(selector).next())
            .map(|elem| collapse_whitespace(&elem.text().collect::<String>()))
            .filter(|summary| !summary.is_empty());

        candidates.push(Candidate::new(
            link,
            title,
            summary,
            json!({ "page": page.label, "listing_url": page.url }),
        ));
    }

    Ok(CandidateBatch::new(page.label.clone(), candidates))
}

struct CompiledSelectors {
    item: Selector,
    title: Selector,
    link: Selector,
    summary: Option<Selector>,
}

impl CompiledSelectors {
    fn compile(selectors: &ListingSelectors) -> Result<Self> {
        Ok(Self {
            item: parse_selector(&selectors.item)?,
            title: parse_selector(&selectors.title)?,
            link: parse_selector(&selectors.link)?,
            summary: selectors
                .summary
                .as_deref()
                .map(parse_selector)
                .transpose()?,
        })
    }
}

pub(crate) fn parse_selector(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|err| anyhow!("invalid selector `{raw}`: {err}"))
}

fn resolve_link(base: &Url, raw: &str) -> Option<String> {
    base.join(raw).ok().map(|url| url.to_string())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
