use std::env;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use amqp_sampler::config::RunConfig;
use amqp_sampler::sampler::Sampler;
use amqp_sampler::{ConsumerSampler, PublisherSampler, SampleOutcome};

#[tokio::main]
async fn main() {
    let config = match RunConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.sampler.endpoint.host,
        exchange = %config.sampler.topology.exchange.name,
        queue = %config.sampler.topology.queue.name,
        "AMQP sampler starting"
    );

    let publish_samples = config.publish_samples.max(1);
    let consume_samples = config.consume_samples.max(1);

    let mut publisher = PublisherSampler::new(config.sampler.clone(), config.publisher.clone());
    for _ in 0..publish_samples {
        let outcome = publisher.run_sample().await;
        report(&outcome);
    }
    publisher.close().await;

    let mut consumer = ConsumerSampler::new(config.sampler.clone(), config.consumer.clone());
    for _ in 0..consume_samples {
        let outcome = consumer.run_sample().await;
        report(&outcome);
    }
    consumer.close().await;

    info!("AMQP sampler finished");
}

fn report(outcome: &SampleOutcome) {
    let elapsed_ms = outcome.elapsed().as_millis() as u64;

    if outcome.success {
        info!(
            label = %outcome.label,
            code = %outcome.response_code,
            elapsed_ms,
            body = outcome.response_body.as_deref().unwrap_or(""),
            "Sample ok"
        );
    } else {
        warn!(
            label = %outcome.label,
            code = %outcome.response_code,
            message = %outcome.response_message,
            elapsed_ms,
            "Sample failed"
        );
    }
}

fn setup_logging(rust_log: &str) {
    let log_level = match rust_log.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
