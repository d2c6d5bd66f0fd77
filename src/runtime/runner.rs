use crate::content::fetch::{ContentFetcher, PageFetcher};
use crate::content::listing::ListingSource;
use crate::evaluator::{EvaluatorParams, ItemEvaluator};
use crate::llm::client::{ChatApiClient, ModelClient};
use crate::pipeline::engine::{EngineParams, EvalEngine, RunSummary};
use crate::pipeline::flusher::OutcomeFlusher;
use crate::runtime::config::EngineConfig;
use crate::runtime::sink::{spawn_sink_writer, JsonlSink};
use crate::runtime::telemetry::{spawn_progress_reporter, RunCounters};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Wires a validated config into a full pipeline and handles OS signals for
/// graceful shutdowns.
pub struct Runner {
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl Runner {
    /// Creates a runner with a root [`CancellationToken`] that propagates
    /// through the entire pipeline (evaluator, engine, reporter).
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns a clone of the root shutdown token so external callers can
    /// integrate with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Builds every component and drives the engine to completion.
    pub async fn run(&self) -> Result<RunSummary> {
        let config = &self.config;

        let model_client: Arc<dyn ModelClient> = Arc::new(ChatApiClient::new(
            config.api_base_url(),
            config.api_key(),
            config.request_timeout(),
        )?);
        let fetcher: Arc<dyn ContentFetcher> = Arc::new(PageFetcher::new(config.fetch_timeout())?);
        let evaluator = Arc::new(ItemEvaluator::new(EvaluatorParams {
            model_client,
            fetcher,
            criteria: config.criteria().to_owned(),
            screening_model: config.screening_model().to_owned(),
            evaluation_model: config.evaluation_model().to_owned(),
            screening_enabled: config.screening_enabled(),
            max_content_chars: config.max_content_chars(),
            retry: config.retry(),
            cancellation: self.shutdown.clone(),
        }));

        let mut source =
            ListingSource::new(config.listing_pages().to_vec(), config.fetch_timeout())?;
        let sink = JsonlSink::create(config.output_path()).await?;

        // Nothing fallible below this point until the engine runs, so the
        // background tasks spawned here are always wound down before returning.
        let (sink_client, sink_task) = spawn_sink_writer(sink);
        let counters = Arc::new(RunCounters::new());
        let flusher = Arc::new(OutcomeFlusher::new());
        let reporter = spawn_progress_reporter(
            Arc::clone(&counters),
            Arc::clone(&flusher),
            self.shutdown.clone(),
            config.progress_interval(),
        );

        let mut engine = EvalEngine::new(EngineParams {
            evaluator,
            concurrency: config.concurrency(),
            flusher,
            sink: sink_client.clone(),
            counters,
            cancellation: self.shutdown.clone(),
        });

        let run_result = engine.run(&mut source).await;

        self.shutdown.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "progress reporter ended abnormally");
        }
        drop(engine);
        drop(sink_client);
        if let Err(err) = sink_task.await {
            tracing::warn!(error = %err, "sink writer ended abnormally");
        }

        run_result
    }

    /// Runs until the engine finishes or a Ctrl-C (SIGINT) interrupts it.
    pub async fn run_until_ctrl_c(&self) -> Result<RunSummary> {
        let shutdown = self.shutdown.clone();
        let signal_task = tokio::spawn(async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    if result.is_ok() {
                        tracing::info!("Ctrl-C received; interrupting the run");
                        shutdown.cancel();
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });

        let summary = self.run().await;
        signal_task.abort();
        let _ = signal_task.await;
        summary
    }
}
