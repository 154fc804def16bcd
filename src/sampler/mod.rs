pub mod classify;
pub mod consumer;
pub mod outcome;
pub mod publisher;

pub use consumer::{ConsumerSampler, InterruptHandle};
pub use outcome::SampleOutcome;
pub use publisher::PublisherSampler;

use async_trait::async_trait;

use crate::messaging::ConnectionError;

/// Harness-facing seam: one sampler instance, driven by one task, one
/// sample at a time. Nothing above this boundary ever sees an error;
/// every failure arrives as a structured outcome.
#[async_trait]
pub trait Sampler: Send {
    fn label(&self) -> &str;

    async fn run_sample(&mut self) -> SampleOutcome;

    /// End-of-test teardown, best-effort.
    async fn close(&mut self);
}

/// Setup failures surfaced before the sampling loop starts timing.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("{0}")]
    Amqp(#[from] lapin::Error),
}
