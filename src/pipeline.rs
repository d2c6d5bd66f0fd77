//! Concurrent evaluation pipeline: the pool bounding in-flight work, the
//! ordered flusher, and the engine loop driving batches through both.

pub mod candidate;
pub mod engine;
pub mod flusher;
pub mod pool;
