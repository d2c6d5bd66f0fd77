//! Two-stage candidate evaluation split across focused submodules:
//! - `prompt`: stage instructions, user-prompt assembly, content clipping
//! - `decision`: lenient-envelope, strict-schema decoding of model replies
//! - `stages`: the per-item state machine tying screening, fetch, and
//!   evaluation together
//! - `tests`: state-machine tests over scripted model/fetcher mocks

mod decision;
mod prompt;
mod stages;


pub use stages::{EvaluatorParams, ItemEvaluator};
