use crate::pipeline::candidate::Outcome;
use crate::runtime::sink::SinkClient;
use crate::runtime::telemetry::RunCounters;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Reorders finished evaluations back into submission order before they reach
/// the sink.
///
/// Batches flush in the order they were submitted and items flush in order
/// within their batch, so the result log always matches the listing order. A
/// still-running head item holds back everything queued behind it.
pub struct OutcomeFlusher {
    state: Mutex<FlushState>,
}

#[derive(Default)]
struct FlushState {
    batches: VecDeque<PendingBatch>,
}

struct PendingBatch {
    label: String,
    items: VecDeque<JoinHandle<Outcome>>,
}

impl FlushState {
    /// Pops the next in-order handle, or `None` when the queue is empty.
    ///
    /// With `only_finished` set, an unfinished head item stops the walk instead
    /// of being taken.
    fn take_next(&mut self, only_finished: bool) -> Option<JoinHandle<Outcome>> {
        let batch = self.batches.front_mut()?;
        let next = batch.items.front().expect("queued batches are never empty");
        if only_finished && !next.is_finished() {
            return None;
        }

        let handle = batch.items.pop_front();
        if batch.items.is_empty() {
            let done = self.batches.pop_front().expect("front batch must exist");
            tracing::debug!(batch = %done.label, "batch fully flushed");
        }
        handle
    }
}

impl OutcomeFlusher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlushState::default()),
        }
    }

    /// Enqueues one batch worth of evaluation handles behind everything already
    /// pending. Empty batches are dropped on the spot.
    pub async fn submit_batch(&self, label: impl Into<String>, handles: Vec<JoinHandle<Outcome>>) {
        if handles.is_empty() {
            return;
        }
        let label = label.into();
        tracing::debug!(batch = %label, items = handles.len(), "batch queued for ordered flush");
        let mut state = self.state.lock().await;
        state.batches.push_back(PendingBatch {
            label,
            items: handles.into_iter().collect(),
        });
    }

    /// Flushes every item that is already finished and reachable in order,
    /// stopping at the first one still running. Returns how many were flushed.
    pub async fn drain_ready(&self, sink: &SinkClient, counters: &RunCounters) -> Result<usize> {
        self.drain(sink, counters, true).await
    }

    /// Flushes everything pending, waiting for unfinished items as they come up
    /// in order. Returns how many were flushed.
    pub async fn drain_all(&self, sink: &SinkClient, counters: &RunCounters) -> Result<usize> {
        self.drain(sink, counters, false).await
    }

    async fn drain(
        &self,
        sink: &SinkClient,
        counters: &RunCounters,
        only_finished: bool,
    ) -> Result<usize> {
        let mut flushed = 0;
        loop {
            // The lock is held only for the walk; awaiting the handle and the
            // sink happens outside it so new batches can queue up meanwhile.
            let handle = {
                let mut state = self.state.lock().await;
                match state.take_next(only_finished) {
                    Some(handle) => handle,
                    None => break,
                }
            };

            let outcome = handle
                .await
                .context("evaluation task was aborted or panicked")?;
            counters.record_outcome(&outcome);
            sink.record(outcome).await?;
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Aborts every evaluation still queued and forgets about it. Returns the
    /// number of aborted items.
    pub async fn abort_pending(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut aborted = 0;
        for batch in &state.batches {
            for handle in &batch.items {
                handle.abort();
                aborted += 1;
            }
        }
        state.batches.clear();
        aborted
    }

    pub async fn pending_batches(&self) -> usize {
        self.state.lock().await.batches.len()
    }

    pub async fn pending_items(&self) -> usize {
        let state = self.state.lock().await;
        state.batches.iter().map(|batch| batch.items.len()).sum()
    }
}

impl Default for OutcomeFlusher {
    fn default() -> Self {
        Self::new()
    }
}
