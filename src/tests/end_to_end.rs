//! Client SDK against an in-process broker over real WebSockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::Broker;
use crate::broker::engine::{SharedBroker, lock};
use crate::broker::message::Destination;
use crate::broker::queue::QueueSpec;
use crate::broker::topic::TopicSubscription;
use crate::client::{
    ActivationState, Metric, MessagingService, MissingResourcesCreationStrategy,
    OutboundMessageBuilder, RetryStrategy, ServiceEvent, ServiceState, Topic,
};
use crate::config::{BrokerSettings, Settings};
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::transport::{BrokerServer, ServerHandle};
use crate::utils::Error;

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker() -> (SharedBroker, ServerHandle) {
    let broker = Arc::new(Mutex::new(Broker::new(BrokerSettings::default())));
    let server = BrokerServer::bind("127.0.0.1:0", broker.clone())
        .await
        .expect("bind broker");
    let handle = server.spawn().expect("spawn broker");
    (broker, handle)
}

async fn connected_service(handle: &ServerHandle) -> MessagingService {
    let service = MessagingService::builder()
        .with_host("127.0.0.1")
        .with_port(handle.local_addr().port())
        .with_basic_authentication("admin", "password")
        .with_reconnection_retry_strategy(RetryStrategy::parametrized_retry(
            20,
            Duration::from_millis(50),
        ))
        .build();
    service.connect().await.expect("connect");
    service
}

fn text(payload: &str) -> crate::client::OutboundMessage {
    OutboundMessageBuilder::new().build(payload)
}

fn subscription(expression: &str) -> TopicSubscription {
    TopicSubscription::parse(expression).unwrap()
}

async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<ServiceEvent>,
    wanted: fn(&ServiceEvent) -> bool,
) -> ServiceEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event arrived")
}

#[tokio::test]
async fn hello_world_is_received_exactly_once() {
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let receiver = service
        .create_direct_message_receiver_builder()
        .with_subscriptions([subscription("solace/samples/*")])
        .build();
    receiver.start().await.unwrap();

    let publisher = service.create_direct_message_publisher_builder().build();
    publisher.start().unwrap();
    publisher
        .publish(text("Hello world"), &Topic::of("solace/samples/hello"))
        .await
        .unwrap();

    let message = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.payload_as_string().as_deref(), Some("Hello world"));
    assert_eq!(message.destination_name(), "solace/samples/hello");
    assert!(
        receiver
            .receive_message_timeout(Duration::from_millis(200))
            .await
            .unwrap()
            .is_none()
    );

    publisher.terminate(Duration::from_secs(1)).await;
    receiver.terminate(Duration::from_secs(1)).await;
    service.disconnect().await.unwrap();
    assert_eq!(service.state(), ServiceState::Disconnected);
    handle.shutdown().await;
}

#[tokio::test]
async fn bad_credentials_are_not_retried() {
    let (_broker, handle) = start_broker().await;
    let service = MessagingService::builder()
        .with_port(handle.local_addr().port())
        .with_basic_authentication("admin", "wrong")
        .with_connection_retry_strategy(RetryStrategy::forever_retry(Duration::from_millis(10)))
        .build();

    let err = service.connect().await.unwrap_err();
    assert!(matches!(err, Error::Authentication(_)));
    assert_eq!(service.metrics().get_value(Metric::ConnectionAttempts), 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn subscriptions_survive_reconnection() {
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;
    let mut events = service.events();

    let receiver = service
        .create_direct_message_receiver_builder()
        .with_subscriptions([subscription("sensors/>")])
        .build();
    receiver.start().await.unwrap();
    let publisher = service.create_direct_message_publisher_builder().build();
    publisher.start().unwrap();

    handle.drop_connections();
    let attempt = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::ReconnectionAttempt { .. })
    })
    .await;
    assert!(matches!(attempt, ServiceEvent::ReconnectionAttempt { attempt: 1, .. }));
    wait_for_event(&mut events, |e| matches!(e, ServiceEvent::Reconnected)).await;
    assert!(service.is_connected());

    publisher
        .publish(text("after"), &Topic::of("sensors/room1/temp"))
        .await
        .unwrap();
    let message = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.payload_as_string().as_deref(), Some("after"));
    assert_eq!(service.metrics().get_value(Metric::Reconnections), 1);

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn exhausted_reconnection_interrupts_blocked_receivers() {
    let (_broker, handle) = start_broker().await;
    let service = MessagingService::builder()
        .with_port(handle.local_addr().port())
        .with_reconnection_retry_strategy(RetryStrategy::never_retry())
        .build();
    service.connect().await.unwrap();
    let mut events = service.events();

    let receiver = Arc::new(
        service
            .create_direct_message_receiver_builder()
            .with_subscriptions([subscription("a/b")])
            .build(),
    );
    receiver.start().await.unwrap();
    let waiting = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move { receiver.receive_message().await })
    };

    handle.shutdown().await;
    let event = wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::ServiceInterrupted { .. })
    })
    .await;
    assert!(matches!(event, ServiceEvent::ServiceInterrupted { .. }));
    assert_eq!(service.state(), ServiceState::Disconnected);

    let outcome = tokio::time::timeout(WAIT, waiting).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(Error::Interrupted(_))));

    let publisher = service.create_direct_message_publisher_builder().build();
    assert!(matches!(publisher.start(), Err(Error::IllegalState(_))));
}

#[tokio::test]
async fn reject_strategy_fails_when_buffer_is_full() {
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let publisher = service
        .create_direct_message_publisher_builder()
        .on_back_pressure_reject(2)
        .build();
    publisher.start().unwrap();

    // the pump task cannot run between these calls on a single-threaded runtime
    let topic = Topic::of("burst/x");
    publisher.try_publish(text("1"), &topic).unwrap();
    publisher.try_publish(text("2"), &topic).unwrap();
    let err = publisher.try_publish(text("3"), &topic).unwrap_err();
    assert!(matches!(err, Error::PublisherOverflow { capacity: 2 }));
    assert_eq!(service.metrics().get_value(Metric::PublisherOverflows), 1);

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let ready_tx = Mutex::new(Some(ready_tx));
    publisher.set_publisher_readiness_listener(move || {
        if let Some(tx) = ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });
    publisher.notify_when_ready();
    tokio::time::timeout(WAIT, ready_rx).await.unwrap().unwrap();
    publisher.try_publish(text("3"), &topic).unwrap();

    publisher.terminate(Duration::from_secs(1)).await;
    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn rejected_direct_message_reaches_failure_listener() {
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let publisher = service.create_direct_message_publisher_builder().build();
    publisher.start().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    publisher.set_publish_failure_listener(move |failed| {
        let _ = tx.send(failed);
    });

    publisher
        .publish(text("nope"), &Topic::of("bad//topic"))
        .await
        .unwrap();
    let failed = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(failed.error.contains("bad//topic"));

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn every_persistent_publish_gets_one_receipt() {
    let (broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let receiver = service
        .create_persistent_message_receiver_builder()
        .with_subscriptions([subscription("orders/>")])
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::durable_non_exclusive("orders"))
        .unwrap();
    receiver.start().await.unwrap();

    let publisher = service
        .create_persistent_message_publisher_builder()
        .build::<usize>();
    let (tx, mut rx) = mpsc::unbounded_channel();
    publisher.set_message_publish_receipt_listener(move |receipt| {
        let _ = tx.send((receipt.user_context, receipt.is_persisted()));
    });
    publisher.start().unwrap();

    for i in 0..5 {
        publisher
            .publish_with_context(text(&format!("order {i}")), &Topic::of("orders/new"), i)
            .await
            .unwrap();
    }
    // a topic no queue subscribes to is still a successful publish
    publisher
        .publish_with_context(text("lost"), &Topic::of("nobody/listens"), 99)
        .await
        .unwrap();

    let mut contexts = Vec::new();
    for _ in 0..6 {
        let (context, persisted) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(persisted);
        contexts.push(context.unwrap());
    }
    contexts.sort_unstable();
    assert_eq!(contexts, vec![0, 1, 2, 3, 4, 99]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no second receipt");

    for _ in 0..5 {
        let message = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
        receiver.ack(&message).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(lock(&broker).queue_depth("orders"), Some(0));

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn acknowledging_twice_settles_once() {
    let (broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let receiver = service
        .create_persistent_message_receiver_builder()
        .with_subscriptions([subscription("jobs/*")])
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::non_durable_exclusive(None))
        .unwrap();
    receiver.start().await.unwrap();
    let queue = receiver.queue().name.clone();

    let publisher = service.create_persistent_message_publisher_builder().build::<()>();
    publisher.start().unwrap();
    publisher
        .publish_await_acknowledgement(text("job"), &Topic::of("jobs/1"), WAIT)
        .await
        .unwrap();

    let message = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
    receiver.ack(&message).unwrap();
    receiver.ack(&message).unwrap();
    assert_eq!(service.metrics().get_value(Metric::MessagesAcknowledged), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let broker = lock(&broker);
        let queue = broker.queue(&queue).expect("temporary queue exists");
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 0);
    }

    receiver.terminate(Duration::from_secs(1)).await;
    service.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(lock(&broker).queue(&queue).is_none(), "temporary queue removed with its session");
    handle.shutdown().await;
}

#[tokio::test]
async fn paused_receiver_defers_callbacks_until_resumed() {
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let receiver = service
        .create_persistent_message_receiver_builder()
        .with_subscriptions([subscription("ticks/>")])
        .with_message_auto_acknowledgement()
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::durable_exclusive("ticks"))
        .unwrap();
    receiver.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    receiver
        .receive_async(move |message| {
            let _ = tx.send(message.payload_as_string().unwrap_or_default());
        })
        .unwrap();
    receiver.pause().unwrap();
    assert!(receiver.is_paused());

    let publisher = service.create_persistent_message_publisher_builder().build::<()>();
    publisher.start().unwrap();
    for i in 0..3 {
        publisher
            .publish_await_acknowledgement(text(&format!("tick {i}")), &Topic::of("ticks/a"), WAIT)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "no callbacks while paused");

    receiver.resume().unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, vec!["tick 0", "tick 1", "tick 2"]);

    receiver.terminate(Duration::from_secs(1)).await;
    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn request_gets_reply_or_timeout_never_both() {
    let (_broker, handle) = start_broker().await;
    let responder = connected_service(&handle).await;
    let requester = connected_service(&handle).await;

    let replier = responder
        .create_request_reply_message_receiver_builder()
        .build(subscription("svc/echo"));
    replier.start().await.unwrap();
    replier
        .receive_async(|request, replier| {
            let body = format!("echo: {}", request.payload_as_string().unwrap_or_default());
            replier.reply(OutboundMessageBuilder::new().build(body)).unwrap();
        })
        .unwrap();

    let publisher = requester
        .create_request_reply_message_publisher_builder()
        .build();
    publisher.start().await.unwrap();

    let reply = publisher
        .publish_await_response(text("ping"), &Topic::of("svc/echo"), WAIT)
        .await
        .unwrap();
    assert_eq!(reply.payload_as_string().as_deref(), Some("echo: ping"));
    assert!(reply.correlation_id().is_some());

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&calls);
    publisher
        .publish(
            text("anyone?"),
            &Topic::of("svc/nobody"),
            Duration::from_millis(100),
            "ctx",
            move |outcome, context| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((outcome.is_err(), context));
            },
        )
        .await
        .unwrap();
    let (failed, context) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(failed);
    assert_eq!(context, "ctx");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(requester.metrics().get_value(Metric::RequestTimeouts), 1);

    requester.disconnect().await.unwrap();
    responder.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn reply_without_reply_to_reaches_failure_listener() {
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let replier = service
        .create_request_reply_message_receiver_builder()
        .build(subscription("plain/topic"));
    replier.start().await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    replier.set_reply_failure_listener(move |failed| {
        let _ = tx.send(failed);
    });

    let publisher = service.create_direct_message_publisher_builder().build();
    publisher.start().unwrap();
    publisher
        .publish(
            OutboundMessageBuilder::new()
                .with_correlation_id("c-1")
                .build("no reply-to"),
            &Topic::of("plain/topic"),
        )
        .await
        .unwrap();

    let (_request, reply) = replier.receive_message().await.unwrap();
    let err = reply.reply(text("answer")).unwrap_err();
    assert!(matches!(err, Error::IllegalState(_)));
    let failed = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(failed.correlation_id.as_deref(), Some("c-1"));

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn browser_reads_without_consuming() {
    let (broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let creator = service
        .create_persistent_message_receiver_builder()
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::durable_exclusive("audit"))
        .unwrap();
    creator.start().await.unwrap();
    creator.terminate(Duration::from_millis(100)).await;

    let publisher = service.create_persistent_message_publisher_builder().build::<()>();
    publisher.start().unwrap();
    for body in ["first", "second"] {
        publisher
            .publish_await_acknowledgement(text(body), Destination::Queue("audit".into()), WAIT)
            .await
            .unwrap();
    }

    let browser = service
        .create_message_queue_browser_builder()
        .build("audit")
        .unwrap();
    browser.start().unwrap();
    let first = browser
        .receive_message_timeout(WAIT)
        .await
        .unwrap()
        .unwrap();
    let second = browser
        .receive_message_timeout(WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.payload_as_string().as_deref(), Some("first"));
    assert_eq!(second.payload_as_string().as_deref(), Some("second"));
    assert!(browser.try_receive().await.unwrap().is_none());
    assert_eq!(lock(&broker).queue_depth("audit"), Some(2));

    browser.remove(&first).await.unwrap();
    assert_eq!(lock(&broker).queue_depth("audit"), Some(1));

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn acknowledgments_reach_the_broker_after_reconnection() {
    let (broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;
    let mut events = service.events();

    let receiver = service
        .create_persistent_message_receiver_builder()
        .with_subscriptions([subscription("jobs/>")])
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::non_durable_exclusive(None))
        .unwrap();
    receiver.start().await.unwrap();
    let queue = receiver.queue().name.clone();
    let publisher = service.create_persistent_message_publisher_builder().build::<()>();
    publisher.start().unwrap();

    publisher
        .publish_await_acknowledgement(text("before"), &Topic::of("jobs/1"), WAIT)
        .await
        .unwrap();
    let first = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
    receiver.ack(&first).unwrap();

    handle.drop_connections();
    wait_for_event(&mut events, |e| matches!(e, ServiceEvent::Reconnected)).await;

    publisher
        .publish_await_acknowledgement(text("after"), &Topic::of("jobs/2"), WAIT)
        .await
        .unwrap();
    let second = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(second.payload_as_string().as_deref(), Some("after"));
    let (first_tag, second_tag) = (first.delivery_tag().unwrap(), second.delivery_tag().unwrap());
    assert_ne!(first_tag, second_tag);

    receiver.ack(&second).unwrap();
    // the stale tag must not settle anything on the new connection
    receiver.ack(&first).unwrap();
    assert_eq!(service.metrics().get_value(Metric::MessagesAcknowledged), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let broker = lock(&broker);
        let queue = broker.queue(&queue).expect("temporary queue rebound");
        assert_eq!(queue.in_flight_count(), 0);
        assert_eq!(queue.depth(), 0);
    }

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn trace_context_crosses_the_broker() {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    crate::client::install_propagator();
    let (_broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let receiver = service
        .create_direct_message_receiver_builder()
        .with_subscriptions([subscription("traced/>")])
        .build();
    receiver.start().await.unwrap();
    receiver
        .receive_async(move |message| {
            let _ = tx.send(message.trace_context().span().span_context().trace_id());
        })
        .unwrap();

    let trace_id = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
    let parent = opentelemetry::Context::new().with_remote_span_context(SpanContext::new(
        trace_id,
        SpanId::from_hex("b7ad6b7169203331").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ));
    let publisher = service.create_direct_message_publisher_builder().build();
    publisher.start().unwrap();
    publisher
        .publish(
            OutboundMessageBuilder::new()
                .with_trace_context(&parent)
                .build("traced"),
            &Topic::of("traced/order"),
        )
        .await
        .unwrap();

    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received, trace_id);

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

async fn wait_for_state(service: &MessagingService, wanted: ServiceState) {
    tokio::time::timeout(WAIT, async {
        while service.state() != wanted {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("service reached state");
}

async fn read_client_frame(ws: &mut WebSocketStream<TcpStream>) -> ClientFrame {
    loop {
        match ws.next().await.expect("client frame").expect("websocket read") {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn write_server_frame(ws: &mut WebSocketStream<TcpStream>, frame: &ServerFrame) {
    let text = serde_json::to_string(frame).unwrap();
    ws.send(WsMessage::text(text)).await.unwrap();
}

#[tokio::test]
async fn unconfirmed_persistent_publish_is_republished_after_reconnection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    // first connection swallows the publish, second one confirms it
    let scripted = tokio::spawn(async move {
        for connection in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            assert!(matches!(read_client_frame(&mut ws).await, ClientFrame::Connect { .. }));
            let connected = ServerFrame::Connected {
                session_id: format!("session-{connection}"),
            };
            write_server_frame(&mut ws, &connected).await;

            let ClientFrame::Publish {
                message,
                receipt: Some(receipt),
                ..
            } = read_client_frame(&mut ws).await
            else {
                panic!("expected a persistent publish");
            };
            seen_tx.send((receipt, message.message_id)).unwrap();

            if connection == 1 {
                let confirmed = ServerFrame::PublishReceipt {
                    receipt,
                    error: None,
                };
                write_server_frame(&mut ws, &confirmed).await;
                while let Some(Ok(_)) = ws.next().await {}
            }
        }
    });

    let service = MessagingService::builder()
        .with_port(port)
        .with_reconnection_retry_strategy(RetryStrategy::parametrized_retry(
            20,
            Duration::from_millis(50),
        ))
        .build();
    service.connect().await.unwrap();
    let publisher = service.create_persistent_message_publisher_builder().build::<&str>();
    let (tx, mut rx) = mpsc::unbounded_channel();
    publisher.set_message_publish_receipt_listener(move |receipt| {
        let _ = tx.send((receipt.user_context, receipt.is_persisted()));
    });
    publisher.start().unwrap();
    publisher
        .publish_with_context(text("keep me"), Destination::Queue("q".into()), "only")
        .await
        .unwrap();

    let first = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, second, "same receipt and message on the new connection");

    let receipt = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(receipt, (Some("only"), true));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "no second receipt");
    assert_eq!(service.metrics().get_value(Metric::Reconnections), 1);

    service.disconnect().await.unwrap();
    scripted.await.unwrap();
}

#[tokio::test]
async fn timed_out_receipt_is_never_delivered() {
    let (broker, handle) = start_broker().await;
    let mut publisher_settings = Settings::default().publisher;
    publisher_settings.ack_timeout_ms = 100;
    let service = MessagingService::builder()
        .with_port(handle.local_addr().port())
        .with_reconnection_retry_strategy(RetryStrategy::parametrized_retry(
            20,
            Duration::from_millis(400),
        ))
        .with_publisher_settings(publisher_settings)
        .build();
    service.connect().await.unwrap();
    let mut events = service.events();

    let creator = service
        .create_persistent_message_receiver_builder()
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::durable_exclusive("q"))
        .unwrap();
    creator.start().await.unwrap();
    creator.terminate(Duration::from_millis(100)).await;

    let publisher = service.create_persistent_message_publisher_builder().build::<()>();
    let (tx, mut rx) = mpsc::unbounded_channel();
    publisher.set_message_publish_receipt_listener(move |receipt| {
        let _ = tx.send(receipt.error);
    });
    publisher.start().unwrap();

    handle.drop_connections();
    wait_for_state(&service, ServiceState::Reconnecting).await;
    publisher
        .publish(text("too late"), Destination::Queue("q".into()))
        .await
        .unwrap();

    let error = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(error, Some(Error::Timeout(_))));

    wait_for_event(&mut events, |e| matches!(e, ServiceEvent::Reconnected)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lock(&broker).queue_depth("q"), Some(0));
    assert!(rx.try_recv().is_err(), "one outcome only");

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn exclusive_queue_fails_over_to_the_passive_receiver() {
    let (_broker, handle) = start_broker().await;
    let first_service = connected_service(&handle).await;
    let second_service = connected_service(&handle).await;

    let bind = |service: &MessagingService| {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = service
            .create_persistent_message_receiver_builder()
            .with_subscriptions([subscription("failover/>")])
            .with_message_auto_acknowledgement()
            .with_missing_resources_creation_strategy(
                MissingResourcesCreationStrategy::CreateOnStart,
            )
            .with_activation_passivation_support(move |state| {
                let _ = tx.send(state);
            })
            .build(QueueSpec::durable_exclusive("failover"))
            .unwrap();
        (receiver, rx)
    };
    let (first, mut first_states) = bind(&first_service);
    first.start().await.unwrap();
    let (second, mut second_states) = bind(&second_service);
    second.start().await.unwrap();

    let state = tokio::time::timeout(WAIT, first_states.recv()).await.unwrap();
    assert_eq!(state, Some(ActivationState::Active));
    let state = tokio::time::timeout(WAIT, second_states.recv()).await.unwrap();
    assert_eq!(state, Some(ActivationState::Passive));

    let publisher = first_service
        .create_persistent_message_publisher_builder()
        .build::<()>();
    publisher.start().unwrap();
    publisher
        .publish_await_acknowledgement(text("one"), &Topic::of("failover/a"), WAIT)
        .await
        .unwrap();
    let message = first.receive_message_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.payload_as_string().as_deref(), Some("one"));

    first.terminate(Duration::from_millis(100)).await;
    let state = tokio::time::timeout(WAIT, second_states.recv()).await.unwrap();
    assert_eq!(state, Some(ActivationState::Active));

    publisher
        .publish_await_acknowledgement(text("two"), &Topic::of("failover/a"), WAIT)
        .await
        .unwrap();
    let message = second.receive_message_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.payload_as_string().as_deref(), Some("two"));

    first_service.disconnect().await.unwrap();
    second_service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn shared_subscription_spreads_messages_round_robin() {
    let (_broker, handle) = start_broker().await;
    let first_service = connected_service(&handle).await;
    let second_service = connected_service(&handle).await;

    let mut receivers = Vec::new();
    for service in [&first_service, &second_service] {
        let receiver = service
            .create_direct_message_receiver_builder()
            .with_subscriptions([subscription("work/>")])
            .with_share_name("workers")
            .build();
        receiver.start().await.unwrap();
        receivers.push(receiver);
    }

    let publisher = first_service.create_direct_message_publisher_builder().build();
    publisher.start().unwrap();
    for i in 0..4 {
        publisher
            .publish(text(&format!("job {i}")), &Topic::of("work/item"))
            .await
            .unwrap();
    }

    for receiver in &receivers {
        for _ in 0..2 {
            assert!(receiver.receive_message_timeout(WAIT).await.unwrap().is_some());
        }
        assert!(
            receiver
                .receive_message_timeout(Duration::from_millis(200))
                .await
                .unwrap()
                .is_none(),
            "each member gets half"
        );
    }

    first_service.disconnect().await.unwrap();
    second_service.disconnect().await.unwrap();
    handle.shutdown().await;
}

#[tokio::test]
async fn refreshed_access_token_is_used_on_reconnection() {
    let (broker, handle) = start_broker().await;
    let token = |subject: &str| {
        lock(&broker)
            .issue_token(subject, chrono::Duration::minutes(5))
            .unwrap()
    };
    let service = MessagingService::builder()
        .with_port(handle.local_addr().port())
        .with_oauth2_authentication(token("alice"))
        .with_reconnection_retry_strategy(RetryStrategy::parametrized_retry(
            5,
            Duration::from_millis(50),
        ))
        .build();
    service.connect().await.unwrap();
    let mut events = service.events();

    service.update_access_token(token("bob")).unwrap();
    handle.drop_connections();
    wait_for_event(&mut events, |e| matches!(e, ServiceEvent::Reconnected)).await;
    assert!(service.is_connected());

    service.update_access_token("not-a-token").unwrap();
    handle.drop_connections();
    wait_for_event(&mut events, |e| {
        matches!(e, ServiceEvent::ServiceInterrupted { .. })
    })
    .await;
    assert_eq!(service.state(), ServiceState::Disconnected);
    handle.shutdown().await;
}

#[tokio::test]
async fn pull_receiver_acknowledges_automatically() {
    let (broker, handle) = start_broker().await;
    let service = connected_service(&handle).await;

    let receiver = service
        .create_persistent_message_receiver_builder()
        .with_subscriptions([subscription("auto/>")])
        .with_message_auto_acknowledgement()
        .with_missing_resources_creation_strategy(MissingResourcesCreationStrategy::CreateOnStart)
        .build(QueueSpec::durable_non_exclusive("auto"))
        .unwrap();
    receiver.start().await.unwrap();

    let publisher = service.create_persistent_message_publisher_builder().build::<()>();
    publisher.start().unwrap();
    publisher
        .publish_await_acknowledgement(text("settle me"), &Topic::of("auto/x"), WAIT)
        .await
        .unwrap();

    let message = receiver.receive_message_timeout(WAIT).await.unwrap().unwrap();
    assert_eq!(message.payload_as_string().as_deref(), Some("settle me"));
    assert_eq!(service.metrics().get_value(Metric::MessagesAcknowledged), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    {
        let broker = lock(&broker);
        let queue = broker.queue("auto").expect("queue exists");
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.in_flight_count(), 0);
    }

    service.disconnect().await.unwrap();
    handle.shutdown().await;
}
