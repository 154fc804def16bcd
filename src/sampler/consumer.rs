use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConsumerConfig, SamplerConfig};
use crate::messaging::{ConnectionManager, TopologyManager};
use crate::sampler::classify;
use crate::sampler::outcome::SampleOutcome;
use crate::sampler::{Sampler, SamplerError};

pub const TIMESTAMP_PARAMETER: &str = "Timestamp";
pub const EXCHANGE_PARAMETER: &str = "Exchange";
pub const ROUTING_KEY_PARAMETER: &str = "Routing Key";
pub const DELIVERY_TAG_PARAMETER: &str = "Delivery Tag";
pub const APP_ID_PARAMETER: &str = "Application ID";

const TIMED_OUT_MESSAGE: &str = "Timed out";
const READ_DISABLED_BODY: &str = "Read response failed";

/// What the delivery-dispatch task pushes through the hand-off slot.
enum ConsumerEvent {
    Delivery(Box<Delivery>),
    Failed(lapin::Error),
    Cancelled,
}

/// What one wait on the slot resolved to.
enum WaitResult {
    Delivery(Box<Delivery>),
    Failed(lapin::Error),
    Cancelled,
    TimedOut,
    Interrupted,
}

/// Long-lived subscription state, built on first consume sample and
/// torn down as a unit from every failure path so the next sample
/// rebuilds it from scratch.
struct ConsumeSession {
    tag: String,
    channel: Channel,
    events: mpsc::Receiver<ConsumerEvent>,
    dispatch: JoinHandle<()>,
}

/// Fired by the harness to abort an in-flight blocking wait. Safe to
/// call from any task, concurrently with the sample.
#[derive(Clone)]
pub struct InterruptHandle {
    notify: Arc<Notify>,
}

impl InterruptHandle {
    /// Best-effort abort; always reports success to the caller.
    pub fn interrupt(&self) -> bool {
        self.notify.notify_waiters();
        true
    }
}

/// Receives from the sampler's queue through one long-lived
/// subscription, bridging the client's asynchronous delivery dispatch
/// into a timeout-bounded, single-in-flight receive.
pub struct ConsumerSampler {
    config: SamplerConfig,
    consumer: ConsumerConfig,
    connection: ConnectionManager,
    topology: TopologyManager,
    session: Option<ConsumeSession>,
    purged: bool,
    interrupt: Arc<Notify>,
}

impl ConsumerSampler {
    pub fn new(config: SamplerConfig, consumer: ConsumerConfig) -> Self {
        let connection = ConnectionManager::new(config.endpoint.clone());
        let topology = TopologyManager::new(config.topology.clone());
        Self {
            config,
            consumer,
            connection,
            topology,
            session: None,
            purged: false,
            interrupt: Arc::new(Notify::new()),
        }
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            notify: self.interrupt.clone(),
        }
    }

    /// One sample: wait for `iterations` deliveries, each bounded by the
    /// receive timeout, acknowledging as configured. A timeout aborts
    /// the whole sample; remaining iterations are not attempted.
    pub async fn sample(&mut self) -> SampleOutcome {
        let mut outcome = SampleOutcome::new(&self.config.name);

        let channel = match self.init_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to initialize channel");
                outcome.set_message(e.to_string());
                return outcome;
            }
        };

        if let Err(e) = self.ensure_session(&channel).await {
            error!(error = %e, "Failed to start consumer");
            outcome.set_message(e.to_string());
            return outcome;
        }

        let iterations = self.config.iterations();
        let receive_timeout = self.consumer.receive_timeout();

        // Owned for the duration of the loop; restored only on success.
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                outcome.set_message("Consumer session unavailable");
                return outcome;
            }
        };

        let mut last_delivery: Option<Box<Delivery>> = None;

        outcome.sample_start();

        for _ in 0..iterations {
            match await_event(&mut session.events, &self.interrupt, receive_timeout).await {
                WaitResult::Delivery(delivery) => {
                    if self.consumer.read_response {
                        outcome.response_body =
                            Some(String::from_utf8_lossy(&delivery.data).into_owned());
                    } else {
                        outcome.response_body = Some(READ_DISABLED_BODY.to_string());
                    }

                    if !self.consumer.auto_ack {
                        // Single tag, never cumulative.
                        if let Err(e) = session
                            .channel
                            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
                            .await
                        {
                            warn!(error = %e, delivery_tag = delivery.delivery_tag, "Failed to ack delivery");
                            outcome.fail(classify::classify(&e), e.to_string());
                            self.teardown_session(session).await;
                            outcome.sample_end();
                            return outcome;
                        }
                    }

                    last_delivery = Some(delivery);
                }
                WaitResult::TimedOut => {
                    outcome.set_message(TIMED_OUT_MESSAGE);
                    self.session = Some(session);
                    outcome.sample_end();
                    return outcome;
                }
                WaitResult::Interrupted => {
                    warn!("Interrupted while waiting for a delivery");
                    outcome.fail(classify::RESPONSE_CODE_INTERRUPTED, "Interrupted");
                    self.teardown_session(session).await;
                    outcome.sample_end();
                    return outcome;
                }
                WaitResult::Cancelled => {
                    warn!("Consumer cancelled by broker");
                    outcome.fail(
                        classify::RESPONSE_CODE_CANCELLED,
                        "Consumer cancelled by broker",
                    );
                    self.teardown_session(session).await;
                    outcome.sample_end();
                    return outcome;
                }
                WaitResult::Failed(e) => {
                    warn!(error = %e, "Consumer failed to consume");
                    outcome.fail(classify::classify(&e), e.to_string());
                    self.teardown_session(session).await;
                    outcome.sample_end();
                    return outcome;
                }
            }
        }

        if self.consumer.use_tx {
            if let Err(e) = session.channel.tx_commit().await {
                warn!(error = %e, "Transaction commit failed");
                outcome.fail(classify::classify(&e), e.to_string());
                self.teardown_session(session).await;
                outcome.sample_end();
                return outcome;
            }
        }

        if let Some(delivery) = &last_delivery {
            outcome.response_headers = Some(format_delivery_headers(delivery));
        }

        outcome.set_ok();
        outcome.sample_end();
        self.session = Some(session);
        outcome
    }

    async fn init_channel(&mut self) -> Result<Channel, SamplerError> {
        let ready = self.connection.ensure_channel(&self.topology).await?;

        if ready.fresh {
            // Any prior subscription rode the old channel.
            if let Some(session) = self.session.take() {
                debug!(tag = %session.tag, "Dropping subscription tied to a dead channel");
                session.dispatch.abort();
            }

            ready
                .channel
                .basic_qos(self.consumer.prefetch_count, BasicQosOptions::default())
                .await?;

            if self.consumer.use_tx {
                ready.channel.tx_select().await?;
            }
        }

        Ok(ready.channel)
    }

    /// Registers the subscription once per session; recreating it per
    /// sample roughly doubles per-message overhead.
    async fn ensure_session(&mut self, channel: &Channel) -> Result<(), lapin::Error> {
        if self.session.is_some() {
            return Ok(());
        }

        let queue = &self.config.topology.queue.name;

        if self.consumer.purge_queue && !self.purged {
            info!(queue = %queue, "Purging queue");
            if let Err(e) = channel.queue_purge(queue, QueuePurgeOptions::default()).await {
                error!(error = %e, queue = %queue, "Failed to purge queue");
            }
            self.purged = true;
        }

        let tag = format!("sampler-{}", Uuid::new_v4());
        info!(queue = %queue, consumer_tag = %tag, "Starting basic consumer");

        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: self.consumer.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let (events_tx, events_rx) = mpsc::channel(1);
        let dispatch = tokio::spawn(dispatch_deliveries(consumer, events_tx));

        self.session = Some(ConsumeSession {
            tag,
            channel: channel.clone(),
            events: events_rx,
            dispatch,
        });

        Ok(())
    }

    /// The single reset transition: cancel broker-side (best-effort),
    /// stop the dispatch task, and leave the next sample to rebuild.
    async fn teardown_session(&mut self, session: ConsumeSession) {
        session.dispatch.abort();

        if session.channel.status().connected() {
            if let Err(e) = session
                .channel
                .basic_cancel(&session.tag, BasicCancelOptions::default())
                .await
            {
                warn!(error = %e, tag = %session.tag, "Could not cancel consumer cleanly");
            }
        }

        self.connection.reset_channel();
        debug!(tag = %session.tag, "Consume session torn down");
    }
}

#[async_trait]
impl Sampler for ConsumerSampler {
    fn label(&self) -> &str {
        &self.config.name
    }

    async fn run_sample(&mut self) -> SampleOutcome {
        self.sample().await
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            self.teardown_session(session).await;
        }
        self.connection.close().await;
    }
}

/// Runs on a task the sampling loop does not control, draining the
/// client's delivery stream into the capacity-1 hand-off slot.
async fn dispatch_deliveries(
    mut consumer: lapin::Consumer,
    events: mpsc::Sender<ConsumerEvent>,
) {
    while let Some(result) = consumer.next().await {
        match result {
            Ok(delivery) => {
                if !offer(&events, delivery) {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "Consumer stream error");
                let _ = events.send(ConsumerEvent::Failed(e)).await;
                return;
            }
        }
    }

    debug!("Consumer stream ended");
    let _ = events.send(ConsumerEvent::Cancelled).await;
}

/// Non-blocking insert into the hand-off slot. At most one undelivered
/// message is held in flight; a delivery arriving while the slot is
/// still full is dropped. Lossy under overload, bounded memory.
/// Returns false when the receiving side is gone.
fn offer(events: &mpsc::Sender<ConsumerEvent>, delivery: Delivery) -> bool {
    match events.try_send(ConsumerEvent::Delivery(Box::new(delivery))) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!("Hand-off slot full, dropping delivery");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Timeout-bounded wait on the hand-off slot, racing the interrupt
/// signal. The slot is the only state shared with the dispatch task.
async fn await_event(
    events: &mut mpsc::Receiver<ConsumerEvent>,
    interrupt: &Notify,
    wait: Duration,
) -> WaitResult {
    tokio::select! {
        _ = interrupt.notified() => WaitResult::Interrupted,
        received = timeout(wait, events.recv()) => match received {
            Err(_) => WaitResult::TimedOut,
            Ok(None) => WaitResult::Cancelled,
            Ok(Some(ConsumerEvent::Delivery(delivery))) => WaitResult::Delivery(delivery),
            Ok(Some(ConsumerEvent::Failed(e))) => WaitResult::Failed(e),
            Ok(Some(ConsumerEvent::Cancelled)) => WaitResult::Cancelled,
        },
    }
}

/// Response-header text composed from the last delivery: fixed fields
/// first, then every broker message header on its own line.
pub fn format_delivery_headers(delivery: &Delivery) -> String {
    let mut text = String::new();

    if let Some(timestamp) = delivery.properties.timestamp() {
        text.push_str(&format!("{}: {}\n", TIMESTAMP_PARAMETER, timestamp));
    }

    text.push_str(&format!(
        "{}: {}\n",
        EXCHANGE_PARAMETER,
        delivery.exchange.as_str()
    ));
    text.push_str(&format!(
        "{}: {}\n",
        ROUTING_KEY_PARAMETER,
        delivery.routing_key.as_str()
    ));
    text.push_str(&format!(
        "{}: {}\n",
        DELIVERY_TAG_PARAMETER, delivery.delivery_tag
    ));

    if let Some(app_id) = delivery.properties.app_id() {
        text.push_str(&format!("{}: {}\n", APP_ID_PARAMETER, app_id.as_str()));
    }

    if let Some(headers) = delivery.properties.headers() {
        for (name, value) in headers.inner() {
            text.push_str(&format!("{}: {}\n", name.as_str(), render_value(value)));
        }
    }

    text
}

fn render_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::Boolean(v) => v.to_string(),
        AMQPValue::ShortShortInt(v) => v.to_string(),
        AMQPValue::ShortShortUInt(v) => v.to_string(),
        AMQPValue::ShortInt(v) => v.to_string(),
        AMQPValue::ShortUInt(v) => v.to_string(),
        AMQPValue::LongInt(v) => v.to_string(),
        AMQPValue::LongUInt(v) => v.to_string(),
        AMQPValue::LongLongInt(v) => v.to_string(),
        AMQPValue::Float(v) => v.to_string(),
        AMQPValue::Double(v) => v.to_string(),
        AMQPValue::Timestamp(v) => v.to_string(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::acker::Acker;
    use lapin::BasicProperties;
    use std::time::Instant;

    fn delivery(tag: u64, exchange: &str, routing_key: &str) -> Delivery {
        Delivery {
            delivery_tag: tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: b"hello".to_vec(),
            acker: Acker::default(),
        }
    }

    #[test]
    fn header_text_fixed_fields_then_message_headers() {
        let mut headers = FieldTable::default();
        headers.insert("x".into(), AMQPValue::LongString("1".into()));

        let mut delivery = delivery(7, "e1", "rk1");
        delivery.properties = BasicProperties::default().with_headers(headers);

        let text = format_delivery_headers(&delivery);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["Exchange: e1", "Routing Key: rk1", "Delivery Tag: 7", "x: 1"]);
    }

    #[test]
    fn timestamp_and_app_id_included_only_when_present() {
        let plain = delivery(1, "e", "rk");
        let text = format_delivery_headers(&plain);
        assert!(!text.contains(TIMESTAMP_PARAMETER));
        assert!(!text.contains(APP_ID_PARAMETER));

        let mut stamped = delivery(1, "e", "rk");
        stamped.properties = BasicProperties::default()
            .with_timestamp(1_700_000_000)
            .with_app_id("loadgen".into());
        let text = format_delivery_headers(&stamped);
        assert!(text.starts_with("Timestamp: 1700000000\n"));
        assert!(text.contains("Application ID: loadgen\n"));
    }

    #[tokio::test]
    async fn second_rapid_delivery_is_dropped() {
        let (tx, mut rx) = mpsc::channel(1);

        assert!(offer(&tx, delivery(1, "e", "rk")));
        assert!(offer(&tx, delivery(2, "e", "rk")));

        let first = rx.try_recv();
        assert!(matches!(
            first,
            Ok(ConsumerEvent::Delivery(ref d)) if d.delivery_tag == 1
        ));
        // The slot held exactly one; the second delivery is gone.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offer_reports_closed_receiver() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert!(!offer(&tx, delivery(1, "e", "rk")));
    }

    #[tokio::test]
    async fn empty_slot_times_out_after_full_wait() {
        let (_tx, mut rx) = mpsc::channel::<ConsumerEvent>(1);
        let interrupt = Notify::new();

        let started = Instant::now();
        let result = await_event(&mut rx, &interrupt, Duration::from_millis(120)).await;

        assert!(matches!(result, WaitResult::TimedOut));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn interrupt_aborts_a_blocked_wait() {
        let (_tx, mut rx) = mpsc::channel::<ConsumerEvent>(1);
        let interrupt = Arc::new(Notify::new());

        let fire = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let handle = InterruptHandle { notify: fire };
            assert!(handle.interrupt());
        });

        let result = await_event(&mut rx, &interrupt, Duration::from_secs(30)).await;
        assert!(matches!(result, WaitResult::Interrupted));
    }

    #[tokio::test]
    async fn dispatch_failure_reaches_the_slot() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(ConsumerEvent::Failed(lapin::Error::MissingHeartbeatError))
            .await
            .unwrap();

        let interrupt = Notify::new();
        let result = await_event(&mut rx, &interrupt, Duration::from_millis(100)).await;
        assert!(matches!(result, WaitResult::Failed(_)));
    }

    #[tokio::test]
    async fn closed_slot_reads_as_cancellation() {
        let (tx, mut rx) = mpsc::channel::<ConsumerEvent>(1);
        drop(tx);

        let interrupt = Notify::new();
        let result = await_event(&mut rx, &interrupt, Duration::from_millis(100)).await;
        assert!(matches!(result, WaitResult::Cancelled));
    }

    #[test]
    fn values_render_without_debug_noise() {
        assert_eq!(render_value(&AMQPValue::LongString("v".into())), "v");
        assert_eq!(render_value(&AMQPValue::LongInt(12)), "12");
        assert_eq!(render_value(&AMQPValue::Boolean(true)), "true");
        assert_eq!(render_value(&AMQPValue::Timestamp(99)), "99");
    }
}
