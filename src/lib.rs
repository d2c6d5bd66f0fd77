pub mod content;
pub mod evaluator;
pub mod llm;
pub mod pipeline;
pub mod runtime;

pub use content::fetch::{ContentFetcher, FetchOutcome, PageFetcher};
pub use content::listing::{CandidateSource, ListingSource};
pub use evaluator::{EvaluatorParams, ItemEvaluator};
pub use llm::backoff::{retry_with_backoff, RetryDisposition, RetryPolicy};
pub use llm::client::{ChatApiClient, ModelClient, ModelError, ModelReply, ModelRequest};
pub use pipeline::candidate::{Candidate, CandidateBatch, Outcome, StageUsage, TokenUsage, Verdict};
pub use pipeline::engine::{EngineParams, EvalEngine, RunSummary};
pub use pipeline::flusher::OutcomeFlusher;
pub use pipeline::pool::EvalPool;
pub use runtime::config::{
    EngineConfig, EngineConfigBuilder, EngineConfigParams, ListingPage, ListingSelectors,
};
pub use runtime::runner::Runner;
pub use runtime::sink::{spawn_sink_writer, JsonlSink, ResultSink, SinkClient};
pub use runtime::telemetry::{init_tracing, CountersSnapshot, RunCounters};
