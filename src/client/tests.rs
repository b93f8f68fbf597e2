use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::{
    SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};

use super::buffer::{
    BackPressure, InboundBuffer, OutboundBuffer, Popped, Pushed, ReceiverBufferStrategy,
};
use super::correlation::CorrelationTable;
use super::lifecycle::{Lifecycle, LifecycleCell};
use super::message::{
    DeliveryTag, InboundMessage, OutboundMessageBuilder, PARTITION_KEY_PROPERTY, Topic,
};
use super::metrics::{ApiMetrics, Metric};
use super::retry::RetryStrategy;
use super::service::{MessagingService, MessagingServiceBuilder, ServiceState, Unsettled};
use super::trace_context::{BAGGAGE_PROPERTY, TRACEPARENT_PROPERTY, install_propagator};
use crate::broker::message::{DeliveryMode, Destination, Message};
use crate::config::{AuthScheme, BackPressureKind, Settings};
use crate::utils::Error;

#[test]
fn retry_count_maps_to_strategy() {
    let interval = Duration::from_millis(50);
    assert_eq!(RetryStrategy::from_count(0, interval), RetryStrategy::Never);
    assert_eq!(
        RetryStrategy::from_count(-1, interval),
        RetryStrategy::Forever { interval }
    );
    assert_eq!(
        RetryStrategy::from_count(3, interval),
        RetryStrategy::Parametrized {
            retries: 3,
            interval
        }
    );
}

#[test]
fn retry_backoff_yields_one_delay_per_retry() {
    let interval = Duration::from_millis(20);
    assert_eq!(RetryStrategy::never_retry().backoff().count(), 0);

    let delays: Vec<_> = RetryStrategy::parametrized_retry(3, interval)
        .backoff()
        .collect();
    assert_eq!(delays, vec![interval; 3]);

    let mut forever = RetryStrategy::forever_retry(interval).backoff();
    for _ in 0..100 {
        assert_eq!(forever.next(), Some(interval));
    }
}

#[tokio::test]
async fn correlation_completes_once() {
    let table: CorrelationTable<u64, &str> = CorrelationTable::new();
    let rx = table.register(1);
    assert!(table.complete(&1, Ok("first")));
    assert!(!table.complete(&1, Ok("second")));
    assert_eq!(table.wait(1, rx, None).await.unwrap(), "first");
    assert!(table.is_empty());
}

#[tokio::test]
async fn correlation_timeout_excludes_late_completion() {
    let table: CorrelationTable<u64, ()> = CorrelationTable::new();
    let rx = table.register(7);
    let outcome = table.wait(7, rx, Some(Duration::from_millis(20))).await;
    assert!(matches!(outcome, Err(Error::Timeout(_))));
    assert!(!table.complete(&7, Ok(())), "late completion must be ignored");
}

#[tokio::test]
async fn correlation_fail_all_interrupts_waiters() {
    let table: Arc<CorrelationTable<String, ()>> = Arc::new(CorrelationTable::new());
    let rx = table.register("a".to_string());
    let _other = table.register("b".to_string());

    assert_eq!(table.fail_all("gone"), 2);
    let outcome = table.wait("a".to_string(), rx, None).await;
    assert!(matches!(outcome, Err(Error::Interrupted(_))));
}

#[tokio::test]
async fn correlation_handler_runs_exactly_once() {
    let table: Arc<CorrelationTable<u64, u32>> = Arc::new(CorrelationTable::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let rx = table.register(3);
    let counter = Arc::clone(&calls);
    table.on_complete(3, rx, Some(Duration::from_secs(5)), move |outcome| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = done_tx.send(outcome.unwrap());
    });
    table.complete(&3, Ok(42));
    table.complete(&3, Ok(43));

    assert_eq!(done_rx.await.unwrap(), 42);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn correlation_outcome_agrees_with_completer() {
    let table: Arc<CorrelationTable<u64, u32>> = Arc::new(CorrelationTable::new());
    for key in 0..200u64 {
        let rx = table.register(key);
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait(key, rx, Some(Duration::from_millis(1))).await })
        };
        tokio::time::sleep(Duration::from_micros(900 + key % 200)).await;
        let completed = table.complete(&key, Ok(1));

        let outcome = waiter.await.unwrap();
        assert_eq!(completed, outcome.is_ok(), "key {key}: {outcome:?}");
    }
}

#[tokio::test]
async fn reject_buffer_overflows() {
    let (buffer, mut rx) = OutboundBuffer::new(BackPressure::Reject { capacity: 2 });
    buffer.try_push(1).unwrap();
    buffer.try_push(2).unwrap();
    assert!(!buffer.has_capacity());
    let err = buffer.try_push(3).unwrap_err();
    assert!(matches!(err, Error::PublisherOverflow { capacity: 2 }));

    assert_eq!(rx.recv().await, Some(1));
    buffer.try_push(3).unwrap();
}

#[tokio::test]
async fn wait_buffer_suspends_until_room() {
    let (buffer, mut rx) = OutboundBuffer::new(BackPressure::Wait { capacity: 1 });
    let buffer = Arc::new(buffer);
    buffer.push(1).await.unwrap();

    let pusher = Arc::clone(&buffer);
    let pending = tokio::spawn(async move { pusher.push(2).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());

    assert_eq!(rx.recv().await, Some(1));
    pending.await.unwrap().unwrap();
    assert_eq!(rx.recv().await, Some(2));
}

#[tokio::test]
async fn readiness_fires_when_room_frees() {
    let (buffer, mut rx) = OutboundBuffer::new(BackPressure::Reject { capacity: 1 });
    buffer.try_push(1).unwrap();

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    buffer.notify_when_ready(move || {
        let _ = ready_tx.send(());
    });
    assert_eq!(rx.recv().await, Some(1));
    tokio::time::timeout(Duration::from_secs(1), ready_rx)
        .await
        .expect("readiness listener called")
        .unwrap();
}

#[test]
fn drop_oldest_marks_discard() {
    let buffer = InboundBuffer::new(ReceiverBufferStrategy::DropOldest { capacity: 2 });
    assert_eq!(buffer.push(1), Pushed::Buffered);
    assert_eq!(buffer.push(2), Pushed::Buffered);
    assert_eq!(buffer.push(3), Pushed::Evicted);

    assert_eq!(buffer.try_pop(), Some((2, true)));
    assert_eq!(buffer.try_pop(), Some((3, false)));
    assert_eq!(buffer.try_pop(), None);
}

#[test]
fn drop_latest_keeps_buffered_messages() {
    let buffer = InboundBuffer::new(ReceiverBufferStrategy::DropLatest { capacity: 1 });
    buffer.push("kept");
    assert_eq!(buffer.push("dropped"), Pushed::Dropped);
    assert_eq!(buffer.try_pop(), Some(("kept", true)));
}

#[tokio::test]
async fn paused_buffer_defers_until_resumed() {
    let buffer = Arc::new(InboundBuffer::new(ReceiverBufferStrategy::Elastic));
    buffer.set_paused(true);
    buffer.push(1);
    assert_eq!(buffer.try_pop(), None);
    assert!(matches!(
        buffer.pop_timeout(Duration::from_millis(20)).await,
        Popped::TimedOut
    ));

    let resumer = Arc::clone(&buffer);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        resumer.set_paused(false);
    });
    assert!(matches!(
        buffer.pop_timeout(Duration::from_secs(1)).await,
        Popped::Item(1, false)
    ));
}

#[tokio::test]
async fn closing_wakes_blocked_pop() {
    let buffer: Arc<InboundBuffer<u32>> = Arc::new(InboundBuffer::new(ReceiverBufferStrategy::Elastic));
    let waiter = Arc::clone(&buffer);
    let pending = tokio::spawn(async move { waiter.pop().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    buffer.close();
    assert_eq!(pending.await.unwrap(), None);
    assert_eq!(buffer.push(5), Pushed::Dropped);
}

#[test]
fn outbound_message_carries_builder_options() {
    let message = OutboundMessageBuilder::new()
        .with_priority(7)
        .with_property("region", "eu")
        .with_partition_key("customer-42")
        .with_time_to_live(Duration::from_secs(30))
        .with_correlation_id("abc")
        .build("payload")
        .into_message(Topic::of("orders/new").into(), DeliveryMode::Persistent);

    assert_eq!(message.destination, Destination::Topic("orders/new".into()));
    assert_eq!(message.delivery_mode, DeliveryMode::Persistent);
    assert_eq!(message.priority, Some(7));
    assert_eq!(message.correlation_id.as_deref(), Some("abc"));
    assert_eq!(
        message.properties.get(PARTITION_KEY_PROPERTY).map(String::as_str),
        Some("customer-42")
    );
    assert_eq!(message.expiration, Some(message.timestamp + 30_000));
}

#[test]
fn inbound_message_exposes_payload_and_tag() {
    let mut message = Message::new(Destination::Topic("a/b".into()), b"hi".to_vec());
    message.reply_to = Some("_inbox/x".into());
    let inbound = InboundMessage::guaranteed(
        message,
        DeliveryTag {
            flow: 4,
            delivery: 9,
            generation: 1,
        },
    );

    assert_eq!(inbound.payload_as_string().as_deref(), Some("hi"));
    assert_eq!(inbound.destination_name(), "a/b");
    assert_eq!(inbound.reply_to(), Some("_inbox/x"));
    let tag = inbound.delivery_tag().unwrap();
    assert_eq!((tag.flow, tag.delivery), (4, 9));
    assert!(!inbound.discard_indication());
}

#[test]
fn unsettled_deliveries_are_scoped_to_their_connection() {
    let tag = |delivery, generation| DeliveryTag {
        flow: 1,
        delivery,
        generation,
    };
    let mut unsettled = Unsettled::default();
    unsettled.track(1, 1);
    assert!(unsettled.settle(&tag(1, 1)));
    assert!(!unsettled.settle(&tag(1, 1)), "second ack is a no-op");

    // a rebound queue numbers its deliveries from 1 again
    unsettled.track(1, 2);
    unsettled.forget();
    unsettled.track(2, 1);
    assert!(!unsettled.settle(&tag(2, 1)), "delivery from before the reconnect");
    assert!(!unsettled.settle(&tag(1, 1)));
    assert!(unsettled.settle(&tag(1, 2)));
    assert_eq!(unsettled.len(), 0);
}

fn remote_trace() -> Context {
    let span_context = SpanContext::new(
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
        SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    Context::new()
        .with_remote_span_context(span_context)
        .with_baggage(vec![KeyValue::new("key1", "val1")])
}

#[test]
fn trace_context_travels_in_properties() {
    install_propagator();
    let message = OutboundMessageBuilder::new()
        .with_trace_context(&remote_trace())
        .build("traced")
        .into_message(Topic::of("a/b").into(), DeliveryMode::Direct);

    assert_eq!(
        message.properties.get(TRACEPARENT_PROPERTY).map(String::as_str),
        Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
    );
    assert_eq!(
        message.properties.get(BAGGAGE_PROPERTY).map(String::as_str),
        Some("key1=val1")
    );

    let cx = InboundMessage::direct(message).trace_context();
    assert_eq!(
        cx.span().span_context().trace_id(),
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
    );
    assert!(cx.span().span_context().is_remote());
    assert_eq!(cx.baggage().get("key1").map(|v| v.to_string()).as_deref(), Some("val1"));
}

#[test]
fn untraced_messages_carry_no_trace_properties() {
    install_propagator();
    let message = OutboundMessageBuilder::new()
        .build("plain")
        .into_message(Topic::of("a/b").into(), DeliveryMode::Direct);
    assert!(message.properties.is_empty());

    let cx = InboundMessage::direct(message).trace_context();
    assert!(!cx.span().span_context().is_valid());
}

#[test]
fn lifecycle_transitions() {
    let cell = LifecycleCell::new("publisher");
    assert!(cell.ensure_started().is_err());
    cell.start().unwrap();
    assert_eq!(cell.get(), Lifecycle::Started);
    assert!(cell.start().is_err());
    assert!(cell.terminate());
    assert!(!cell.terminate());
    assert!(matches!(cell.start(), Err(Error::IllegalState(_))));
}

#[test]
fn metrics_count_and_reset() {
    let metrics = ApiMetrics::new();
    metrics.increment(Metric::DirectMessagesSent);
    metrics.add(Metric::DirectMessagesSent, 2);
    assert_eq!(metrics.get_value(Metric::DirectMessagesSent), 3);
    assert!(metrics.to_string().contains("direct_messages_sent: 3"));
    metrics.reset();
    assert_eq!(metrics.get_value(Metric::DirectMessagesSent), 0);
}

#[test]
fn builder_url_follows_tls_flag() {
    let builder = MessagingServiceBuilder::default()
        .with_host("broker.local")
        .with_port(5443);
    assert_eq!(builder.url(), "ws://broker.local:5443");
    assert_eq!(builder.with_tls(true).url(), "wss://broker.local:5443");
}

#[test]
fn oauth2_settings_require_a_token() {
    let mut settings = Settings::default();
    settings.authentication.scheme = AuthScheme::OAuth2;
    settings.authentication.access_token = None;
    let err = MessagingService::from_settings(&settings).unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    settings.authentication.access_token = Some("token".into());
    assert!(MessagingService::from_settings(&settings).is_ok());
}

#[test]
fn back_pressure_follows_settings() {
    let mut settings = Settings::default();
    settings.publisher.back_pressure = BackPressureKind::Reject;
    settings.publisher.buffer_capacity = 8;
    assert_eq!(
        BackPressure::from_settings(&settings.publisher),
        BackPressure::Reject { capacity: 8 }
    );
}

#[test]
fn reply_timeout_defaults_to_receiver_settings() {
    let mut settings = Settings::default();
    settings.receiver.reply_timeout_ms = 250;
    let service = MessagingServiceBuilder::from_settings(&settings).unwrap().build();

    let requester = service.create_request_reply_message_publisher_builder().build();
    assert_eq!(requester.reply_timeout(), Duration::from_millis(250));

    let requester = service
        .create_request_reply_message_publisher_builder()
        .with_reply_timeout(Duration::from_secs(2))
        .build();
    assert_eq!(requester.reply_timeout(), Duration::from_secs(2));
}

#[tokio::test]
async fn unconnected_service_refuses_work() {
    let service = MessagingService::builder().with_port(1).build();
    assert_eq!(service.state(), ServiceState::NotConnected);

    let publisher = service.create_direct_message_publisher_builder().build();
    assert!(matches!(publisher.start(), Err(Error::IllegalState(_))));
    assert_eq!(publisher.lifecycle(), Lifecycle::NotStarted);

    let receiver = service.create_direct_message_receiver_builder().build();
    assert!(matches!(receiver.start().await, Err(Error::IllegalState(_))));

    assert!(service.update_access_token("t").is_err());
    assert!(service.disconnect().await.is_ok());
}

#[tokio::test]
async fn connect_fails_without_broker() {
    let service = MessagingService::builder()
        .with_host("127.0.0.1")
        .with_port(1)
        .with_connection_retry_strategy(RetryStrategy::parametrized_retry(
            1,
            Duration::from_millis(10),
        ))
        .build();

    let err = service.connect().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(service.metrics().get_value(Metric::ConnectionAttempts), 2);
    assert_eq!(service.state(), ServiceState::NotConnected);
}

#[test]
fn invalid_selector_fails_build() {
    let service = MessagingService::builder().build();
    let built = service
        .create_persistent_message_receiver_builder()
        .with_message_selector("priority >")
        .build(crate::broker::queue::QueueSpec::durable_exclusive("q"));
    assert!(matches!(built, Err(Error::InvalidSelector { .. })));
}
