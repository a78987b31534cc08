// Observer Pipeline (§4.6): turns one prompt turn's raw events into
// durable memory. `pipeline::run_flush` is the entry point; `types` and
// `transcript` are its building blocks, `provider` is the swappable
// capability boundary.

pub mod pipeline;
pub mod provider;
pub mod transcript;
pub mod types;

pub use pipeline::{run_flush, FlushOutcome, FlushRequest};
pub use provider::{HttpObserver, HttpObserverConfig, Observer};
pub use types::{ObserverContext, ObserverUsage, ParsedOutput};
