//! Load-testing sampler for AMQP 0-9-1 brokers.
//!
//! Each sampler instance owns one broker connection and one channel,
//! provisions its exchange/queue topology idempotently, and runs one
//! timed "sample" at a time: a [`PublisherSampler`] publishes a fixed
//! message N times, a [`ConsumerSampler`] waits for N deliveries with a
//! per-delivery timeout. Every sample yields a [`SampleOutcome`] with a
//! stable response code, so the driving harness never handles errors.

pub mod config;
pub mod messaging;
pub mod sampler;

pub use sampler::{ConsumerSampler, InterruptHandle, PublisherSampler, SampleOutcome, Sampler};
