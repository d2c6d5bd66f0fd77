use crate::pipeline::candidate::Outcome;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;

/// Destination for finished evaluations.
///
/// Implementations are driven by a single writer task, so `record` calls never
/// overlap and may keep mutable state without locking.
pub trait ResultSink: Send + 'static {
    fn record<'a>(&'a mut self, outcome: &'a Outcome) -> BoxFuture<'a, Result<()>>;

    /// Called once after the last record of a run has been written.
    fn finalize(&mut self, run_duration: Duration) -> BoxFuture<'_, Result<()>>;
}

enum SinkCommand {
    Record {
        outcome: Outcome,
        ack: oneshot::Sender<Result<()>>,
    },
    Finalize {
        run_duration: Duration,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// Cheap handle for submitting outcomes to the writer task.
///
/// Every call waits for the writer's acknowledgement, so an I/O failure
/// surfaces at the call site that caused it.
#[derive(Clone)]
pub struct SinkClient {
    tx: mpsc::Sender<SinkCommand>,
}

impl SinkClient {
    pub async fn record(&self, outcome: Outcome) -> Result<()> {
        let (ack, ready) = oneshot::channel();
        self.tx
            .send(SinkCommand::Record { outcome, ack })
            .await
            .map_err(|_| anyhow!("result sink writer is gone"))?;
        ready
            .await
            .map_err(|_| anyhow!("result sink writer dropped a record ack"))?
    }

    pub async fn finalize(&self, run_duration: Duration) -> Result<()> {
        let (ack, ready) = oneshot::channel();
        self.tx
            .send(SinkCommand::Finalize { run_duration, ack })
            .await
            .map_err(|_| anyhow!("result sink writer is gone"))?;
        ready
            .await
            .map_err(|_| anyhow!("result sink writer dropped the finalize ack"))?
    }
}

/// Spawns the writer task that owns the sink and serializes all access to it.
///
/// The task exits once every [`SinkClient`] clone has been dropped.
pub fn spawn_sink_writer<S: ResultSink>(mut sink: S) -> (SinkClient, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_BUFFER);
    let handle = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SinkCommand::Record { outcome, ack } => {
                    let _ = ack.send(sink.record(&outcome).await);
                }
                SinkCommand::Finalize { run_duration, ack } => {
                    let _ = ack.send(sink.finalize(run_duration).await);
                }
            }
        }
    });
    (SinkClient { tx }, handle)
}

/// Appends one JSON object per outcome to a line-delimited log file.
pub struct JsonlSink {
    writer: BufWriter<File>,
    path: PathBuf,
    records: u64,
}

impl JsonlSink {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .await
            .with_context(|| format!("creating result log {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            records: 0,
        })
    }

    async fn write_record(&mut self, outcome: &Outcome) -> Result<()> {
        let candidate = outcome.candidate();
        let verdict = outcome.verdict();
        let usage = outcome.usage();
        let record = json!({
            "link": candidate.link(),
            "title": candidate.title(),
            "status": verdict.status(),
            "reason": verdict.reason(),
            "analysis": verdict.analysis(),
            "usage": {
                "screening": { "input": usage.screening.input, "output": usage.screening.output },
                "evaluation": { "input": usage.evaluation.input, "output": usage.evaluation.output },
            },
            "origin": candidate.origin(),
        });

        let mut line = serde_json::to_vec(&record).context("encoding result record")?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .with_context(|| format!("writing to result log {}", self.path.display()))?;
        // One flush per record, so a crash loses at most the line in flight.
        self.writer
            .flush()
            .await
            .with_context(|| format!("flushing result log {}", self.path.display()))?;
        self.records += 1;
        Ok(())
    }
}

impl ResultSink for JsonlSink {
    fn record<'a>(&'a mut self, outcome: &'a Outcome) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.write_record(outcome))
    }

    fn finalize(&mut self, run_duration: Duration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.writer
                .flush()
                .await
                .with_context(|| format!("flushing result log {}", self.path.display()))?;
            tracing::info!(
                records = self.records,
                elapsed_ms = run_duration.as_millis() as u64,
                path = %self.path.display(),
                "result log finalized"
            );
            Ok(())
        })
    }
}
