use crate::content::fetch::{ContentFetcher, FetchOutcome};
use crate::evaluator::decision::{decode_evaluation, decode_screening};
use crate::evaluator::prompt;
use crate::llm::backoff::{retry_with_backoff, RetryDisposition, RetryPolicy};
use crate::llm::client::{ModelClient, ModelReply, ModelRequest};
use crate::pipeline::candidate::{Candidate, Outcome, StageUsage, Verdict};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Characters of error detail carried into an `evaluation_failed` reason.
const MAX_REASON_CHARS: usize = 300;
const MISSING_REASON: &str = "no reason given";

/// Collaborators and knobs for the per-item evaluator.
pub struct EvaluatorParams {
    pub model_client: Arc<dyn ModelClient>,
    pub fetcher: Arc<dyn ContentFetcher>,
    pub criteria: String,
    pub screening_model: String,
    pub evaluation_model: String,
    pub screening_enabled: bool,
    pub max_content_chars: usize,
    pub retry: RetryPolicy,
    pub cancellation: CancellationToken,
}

/// Runs the two-stage match decision for single candidates.
///
/// Stage 1 screens the listing summary with a cheap model and rejects
/// clearly off-topic stories before any content is fetched. Stage 2 fetches
/// the article and evaluates the full text. Every model call goes through
/// the backoff-retrying transport; every failure ends as a terminal verdict
/// on the candidate, never as an error for the caller.
pub struct ItemEvaluator {
    model_client: Arc<dyn ModelClient>,
    fetcher: Arc<dyn ContentFetcher>,
    criteria: String,
    screening_model: String,
    evaluation_model: String,
    screening_enabled: bool,
    max_content_chars: usize,
    retry: RetryPolicy,
    cancellation: CancellationToken,
}

impl ItemEvaluator {
    pub fn new(params: EvaluatorParams) -> Self {
        Self {
            model_client: params.model_client,
            fetcher: params.fetcher,
            criteria: params.criteria,
            screening_model: params.screening_model,
            evaluation_model: params.evaluation_model,
            screening_enabled: params.screening_enabled,
            max_content_chars: params.max_content_chars,
            retry: params.retry,
            cancellation: params.cancellation,
        }
    }

    /// Evaluates one candidate to a terminal outcome.
    ///
    /// Token usage recorded before a failure is preserved on the outcome, so
    /// failed items still account for what they cost.
    pub async fn evaluate(&self, candidate: Candidate) -> Outcome {
        let mut usage = StageUsage::default();

        match self.run_stages(&candidate, &mut usage).await {
            Ok(verdict) => Outcome::new(candidate, verdict, usage),
            Err(err) => {
                tracing::debug!(link = candidate.link(), error = %err, "evaluation failed");
                let verdict = Verdict::EvaluationFailed {
                    reason: clip_reason(&format!("{err:#}")),
                };
                Outcome::new(candidate, verdict, usage)
            }
        }
    }

    async fn run_stages(&self, candidate: &Candidate, usage: &mut StageUsage) -> Result<Verdict> {
        let summary = candidate
            .summary()
            .filter(|summary| self.screening_enabled && !summary.trim().is_empty());
        if let Some(summary) = summary {
            if let Some(rejection) = self.screen_summary(candidate, summary, usage).await? {
                return Ok(rejection);
            }
        }

        let text = match self.fetcher.fetch(candidate.link()).await {
            FetchOutcome::Success { text } => text,
            FetchOutcome::Failed { reason } => return Ok(Verdict::FetchFailed { reason }),
        };

        self.evaluate_content(candidate, &text, usage).await
    }

    /// Stage 1. Returns `Some` when the candidate is rejected on its summary
    /// and `None` when it should continue to the full evaluation.
    async fn screen_summary(
        &self,
        candidate: &Candidate,
        summary: &str,
        usage: &mut StageUsage,
    ) -> Result<Option<Verdict>> {
        let request = ModelRequest {
            model: self.screening_model.clone(),
            system: prompt::SCREENING_SYSTEM.to_string(),
            user: prompt::screening_user(&self.criteria, candidate.title(), summary),
        };
        let reply = self.call_model("screening", request).await?;
        usage.screening.add(reply.usage);

        let decision =
            decode_screening(&reply.content).context("screening reply was not a decision")?;
        if decision.relevant {
            Ok(None)
        } else {
            Ok(Some(Verdict::SummaryRejected {
                reason: decision.reason.unwrap_or_else(|| MISSING_REASON.to_string()),
            }))
        }
    }

    /// Stage 2 over the fetched article text.
    async fn evaluate_content(
        &self,
        candidate: &Candidate,
        text: &str,
        usage: &mut StageUsage,
    ) -> Result<Verdict> {
        let clipped = prompt::clip_content(text, self.max_content_chars);
        let request = ModelRequest {
            model: self.evaluation_model.clone(),
            system: prompt::EVALUATION_SYSTEM.to_string(),
            user: prompt::evaluation_user(&self.criteria, candidate.title(), &clipped),
        };
        let reply = self.call_model("evaluation", request).await?;
        usage.evaluation.add(reply.usage);

        let decision =
            decode_evaluation(&reply.content).context("evaluation reply was not a decision")?;
        let reason = decision.reason.unwrap_or_else(|| MISSING_REASON.to_string());
        if decision.matches {
            Ok(Verdict::Matched {
                reason,
                analysis: decision.analysis,
            })
        } else {
            Ok(Verdict::NotMatched { reason })
        }
    }

    async fn call_model(&self, stage: &'static str, request: ModelRequest) -> Result<ModelReply> {
        retry_with_backoff(
            self.retry,
            Some(&self.cancellation),
            |_| self.model_client.complete(request.clone()),
            |err| {
                if err.is_retryable() {
                    RetryDisposition::Retry
                } else {
                    RetryDisposition::Abort
                }
            },
            |attempt, delay, err| {
                tracing::warn!(
                    stage,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "model call failed, backing off"
                );
            },
        )
        .await
        .with_context(|| format!("{stage} model call failed"))
    }
}

fn clip_reason(text: &str) -> String {
    match text.char_indices().nth(MAX_REASON_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}
