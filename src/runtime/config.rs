use crate::content::listing::parse_selector;
use crate::llm::backoff::RetryPolicy;
use crate::runtime::telemetry::DEFAULT_PROGRESS_INTERVAL;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable holding the chat API key.
pub const API_KEY_ENV: &str = "NEWSIFT_API_KEY";

pub const DEFAULT_API_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_SCREENING_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EVALUATION_MODEL: &str = "gpt-4o";
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 12_000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
pub const DEFAULT_MAX_RETRIES: usize = 3;
pub const DEFAULT_OUTPUT_PATH: &str = "results.jsonl";

/// Reads the API key from the environment (after `dotenvy` has had its say).
pub fn api_key_from_env() -> Result<String> {
    std::env::var(API_KEY_ENV).with_context(|| format!("{API_KEY_ENV} is not set"))
}

/// One listing page to scrape, with the CSS selectors that locate its rows.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingPage {
    pub label: String,
    pub url: String,
    pub selectors: ListingSelectors,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListingSelectors {
    /// Selects one element per candidate row.
    pub item: String,
    /// Selects the title element within a row.
    pub title: String,
    /// Selects the element carrying the row's `href`.
    pub link: String,
    /// Optional selector for a teaser paragraph within a row.
    pub summary: Option<String>,
}

impl ListingPage {
    fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.label, "listing page label")?;
        validate_url(&self.url, "listing page URL")
            .with_context(|| format!("listing page '{}'", self.label))?;
        self.selectors
            .validate()
            .with_context(|| format!("listing page '{}'", self.label))?;
        Ok(())
    }
}

impl ListingSelectors {
    fn validate(&self) -> Result<()> {
        parse_selector(&self.item).context("item selector")?;
        parse_selector(&self.title).context("title selector")?;
        parse_selector(&self.link).context("link selector")?;
        if let Some(summary) = &self.summary {
            parse_selector(summary).context("summary selector")?;
        }
        Ok(())
    }
}

/// Validated configuration for a whole evaluation run.
///
/// All instances must be constructed via [`EngineConfig::builder`] or
/// [`EngineConfig::new`] so invariants are checked before any consumer
/// observes the values. A builder can also be seeded from a TOML run file
/// through [`EngineConfigBuilder::from_file`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    criteria: String,
    screening_model: String,
    evaluation_model: String,
    api_base_url: String,
    api_key: String,
    screening_enabled: bool,
    concurrency: usize,
    max_content_chars: usize,
    request_timeout: Duration,
    fetch_timeout: Duration,
    retry: RetryPolicy,
    listing_pages: Vec<ListingPage>,
    output_path: PathBuf,
    progress_interval: Duration,
}

/// Grouped constructor arguments for [`EngineConfig::new`].
pub struct EngineConfigParams {
    pub criteria: String,
    pub screening_model: String,
    pub evaluation_model: String,
    pub api_base_url: String,
    pub api_key: String,
    pub screening_enabled: bool,
    pub concurrency: usize,
    pub max_content_chars: usize,
    pub request_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    pub listing_pages: Vec<ListingPage>,
    pub output_path: PathBuf,
    pub progress_interval: Duration,
}

impl EngineConfig {
    pub fn new(params: EngineConfigParams) -> Result<Self> {
        let EngineConfigParams {
            criteria,
            screening_model,
            evaluation_model,
            api_base_url,
            api_key,
            screening_enabled,
            concurrency,
            max_content_chars,
            request_timeout,
            fetch_timeout,
            retry,
            listing_pages,
            output_path,
            progress_interval,
        } = params;

        let config = Self {
            criteria: trimmed_string(criteria),
            screening_model: trimmed_string(screening_model),
            evaluation_model: trimmed_string(evaluation_model),
            api_base_url: trimmed_string(api_base_url),
            api_key: trimmed_string(api_key),
            screening_enabled,
            concurrency,
            max_content_chars,
            request_timeout,
            fetch_timeout,
            retry,
            listing_pages,
            output_path,
            progress_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    fn validate(&self) -> Result<()> {
        ensure_not_empty(&self.criteria, "criteria")?;
        ensure_not_empty(&self.screening_model, "screening model")?;
        ensure_not_empty(&self.evaluation_model, "evaluation model")?;
        validate_url(&self.api_base_url, "API base URL")?;
        ensure_not_empty(&self.api_key, "API key")?;
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.max_content_chars == 0 {
            bail!("max content chars must be at least 1");
        }
        if self.request_timeout.is_zero() {
            bail!("request timeout must be non-zero");
        }
        if self.fetch_timeout.is_zero() {
            bail!("fetch timeout must be non-zero");
        }
        if self.retry.base_delay > self.retry.max_delay {
            bail!("retry base delay must not exceed the max delay");
        }
        if self.progress_interval.is_zero() {
            bail!("progress interval must be non-zero");
        }
        if self.listing_pages.is_empty() {
            bail!("at least one listing page is required");
        }
        for page in &self.listing_pages {
            page.validate()?;
        }
        if self.output_path.as_os_str().is_empty() {
            bail!("output path must not be empty");
        }
        Ok(())
    }

    pub fn criteria(&self) -> &str {
        &self.criteria
    }

    pub fn screening_model(&self) -> &str {
        &self.screening_model
    }

    pub fn evaluation_model(&self) -> &str {
        &self.evaluation_model
    }

    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn screening_enabled(&self) -> bool {
        self.screening_enabled
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn max_content_chars(&self) -> usize {
        self.max_content_chars
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn listing_pages(&self) -> &[ListingPage] {
        &self.listing_pages
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }
}

/// Builder with per-field defaults; only criteria, the API key, and the
/// listing pages have none.
#[derive(Default, Debug, Clone)]
pub struct EngineConfigBuilder {
    criteria: Option<String>,
    screening_model: Option<String>,
    evaluation_model: Option<String>,
    api_base_url: Option<String>,
    api_key: Option<String>,
    screening_enabled: Option<bool>,
    concurrency: Option<usize>,
    max_content_chars: Option<usize>,
    request_timeout: Option<Duration>,
    fetch_timeout: Option<Duration>,
    retry_base_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    max_retries: Option<usize>,
    listing_pages: Option<Vec<ListingPage>>,
    output_path: Option<PathBuf>,
    progress_interval: Option<Duration>,
}

impl EngineConfigBuilder {
    /// Seeds a builder from a TOML run file; CLI overrides and the API key are
    /// applied on top before [`EngineConfigBuilder::build`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: RunFile = toml::from_str(contents).context("parsing run config")?;

        let mut builder = EngineConfig::builder();
        if let Some(criteria) = file.criteria {
            builder = builder.criteria(criteria);
        }
        if let Some(model) = file.models.screening {
            builder = builder.screening_model(model);
        }
        if let Some(model) = file.models.evaluation {
            builder = builder.evaluation_model(model);
        }
        if let Some(base_url) = file.api.base_url {
            builder = builder.api_base_url(base_url);
        }
        if let Some(secs) = file.api.timeout_secs {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(concurrency) = file.engine.concurrency {
            builder = builder.concurrency(concurrency);
        }
        if let Some(screening) = file.engine.screening {
            builder = builder.screening_enabled(screening);
        }
        if let Some(chars) = file.engine.max_content_chars {
            builder = builder.max_content_chars(chars);
        }
        if let Some(secs) = file.engine.fetch_timeout_secs {
            builder = builder.fetch_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = file.engine.progress_interval_secs {
            builder = builder.progress_interval(Duration::from_secs(secs));
        }
        if let Some(ms) = file.retry.base_delay_ms {
            builder = builder.retry_base_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = file.retry.max_delay_ms {
            builder = builder.retry_max_delay(Duration::from_millis(ms));
        }
        if let Some(retries) = file.retry.max_retries {
            builder = builder.max_retries(retries);
        }
        if let Some(path) = file.output.path {
            builder = builder.output_path(path);
        }
        if !file.pages.is_empty() {
            builder = builder.listing_pages(file.pages);
        }
        Ok(builder)
    }

    pub fn criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = Some(criteria.into());
        self
    }

    pub fn screening_model(mut self, model: impl Into<String>) -> Self {
        self.screening_model = Some(model.into());
        self
    }

    pub fn evaluation_model(mut self, model: impl Into<String>) -> Self {
        self.evaluation_model = Some(model.into());
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn screening_enabled(mut self, enabled: bool) -> Self {
        self.screening_enabled = Some(enabled);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn max_content_chars(mut self, chars: usize) -> Self {
        self.max_content_chars = Some(chars);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn listing_pages(mut self, pages: Vec<ListingPage>) -> Self {
        self.listing_pages = Some(pages);
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let params = EngineConfigParams {
            criteria: self.criteria.context("criteria is required")?,
            screening_model: self
                .screening_model
                .unwrap_or_else(|| DEFAULT_SCREENING_MODEL.to_owned()),
            evaluation_model: self
                .evaluation_model
                .unwrap_or_else(|| DEFAULT_EVALUATION_MODEL.to_owned()),
            api_base_url: self
                .api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned()),
            api_key: self.api_key.context("api_key is required")?,
            screening_enabled: self.screening_enabled.unwrap_or(true),
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            max_content_chars: self.max_content_chars.unwrap_or(DEFAULT_MAX_CONTENT_CHARS),
            request_timeout: self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            fetch_timeout: self.fetch_timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT),
            retry: RetryPolicy::new(
                self.retry_base_delay.unwrap_or(DEFAULT_RETRY_BASE_DELAY),
                self.retry_max_delay.unwrap_or(DEFAULT_RETRY_MAX_DELAY),
                self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            ),
            listing_pages: self
                .listing_pages
                .context("at least one listing page is required")?,
            output_path: self
                .output_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH)),
            progress_interval: self.progress_interval.unwrap_or(DEFAULT_PROGRESS_INTERVAL),
        };
        EngineConfig::new(params)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunFile {
    criteria: Option<String>,
    #[serde(default)]
    models: ModelsFile,
    #[serde(default)]
    api: ApiFile,
    #[serde(default)]
    engine: EngineFile,
    #[serde(default)]
    retry: RetryFile,
    #[serde(default)]
    output: OutputFile,
    #[serde(default)]
    pages: Vec<ListingPage>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelsFile {
    screening: Option<String>,
    evaluation: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiFile {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineFile {
    concurrency: Option<usize>,
    screening: Option<bool>,
    max_content_chars: Option<usize>,
    fetch_timeout_secs: Option<u64>,
    progress_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RetryFile {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_retries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct OutputFile {
    path: Option<PathBuf>,
}

fn trimmed_string(value: impl Into<String>) -> String {
    value.into().trim().to_owned()
}

fn ensure_not_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{name} must not be empty");
    }
    Ok(())
}

fn validate_url(value: &str, name: &str) -> Result<()> {
    let parsed = Url::parse(value).with_context(|| format!("{name} must be a valid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        bail!("{name} must use http or https");
    }
    Ok(())
}
