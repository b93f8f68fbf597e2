//! CLI for relaymq
//!
//! Subcommands:
//! - `broker`: run the reference broker
//! - `publish`, `subscribe`: direct messaging from the command line
//! - `request`, `reply`: request/reply over a topic
//! - `hello-world`: publish and receive one message on `solace/samples/*`

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use relaymq::broker::Broker;
use relaymq::broker::engine::lock;
use relaymq::broker::topic::TopicSubscription;
use relaymq::client::{MessagingService, OutboundMessageBuilder, Topic, install_propagator};
use relaymq::config::{Settings, load_config_from};
use relaymq::transport::BrokerServer;
use relaymq::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "relaymq", version, about = "Pub/sub messaging SDK and reference broker")]
struct Cli {
    /// Extra configuration file layered over `config/default`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reference broker
    Broker,
    /// Publish messages to a topic
    Publish {
        topic: String,
        message: String,
        /// Publish as guaranteed messages and wait for each receipt
        #[arg(long)]
        persistent: bool,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Print messages matching a subscription
    Subscribe {
        subscription: String,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
    /// Send a request and print the reply
    Request {
        topic: String,
        message: String,
        /// Defaults to `receiver.reply_timeout_ms`
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Answer requests on a subscription by echoing them back
    Reply { subscription: String },
    /// Publish "Hello world" and receive it on `solace/samples/*`
    HelloWorld,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level);
    install_propagator();

    let settings = match load_config_from(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = match cli.command {
        Command::Broker => run_broker(settings).await,
        Command::Publish {
            topic,
            message,
            persistent,
            count,
        } => run_publish(&settings, &topic, &message, persistent, count).await,
        Command::Subscribe {
            subscription,
            count,
        } => run_subscribe(&settings, &subscription, count).await,
        Command::Request {
            topic,
            message,
            timeout_ms,
        } => run_request(&settings, &topic, &message, timeout_ms.map(Duration::from_millis)).await,
        Command::Reply { subscription } => run_reply(&settings, &subscription).await,
        Command::HelloWorld => run_hello_world(&settings).await,
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_broker(settings: Settings) -> relaymq::Result<()> {
    let addr = format!("{}:{}", settings.broker.host, settings.broker.port);
    let broker = Arc::new(Mutex::new(Broker::from_settings(settings.broker)?));
    let server = BrokerServer::bind(&addr, broker.clone()).await?;

    tokio::spawn(Broker::start_maintenance_loop(broker.clone()));

    tokio::select! {
        served = server.run() => {
            if let Err(e) = served {
                error!("Broker server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    lock(&broker).flush()
}

async fn connect(settings: &Settings) -> relaymq::Result<MessagingService> {
    let service = MessagingService::from_settings(settings)?;
    service.connect().await?;
    info!(api = %service.api_info(), client = service.client_name(), "connected");
    Ok(service)
}

async fn run_publish(
    settings: &Settings,
    topic: &str,
    payload: &str,
    persistent: bool,
    count: usize,
) -> relaymq::Result<()> {
    let service = connect(settings).await?;
    let topic = Topic::of(topic);
    let message = OutboundMessageBuilder::new().build(payload);

    if persistent {
        let publisher = service
            .create_persistent_message_publisher_builder()
            .build::<()>();
        publisher.start()?;
        let timeout = Duration::from_millis(settings.publisher.ack_timeout_ms);
        for _ in 0..count {
            publisher
                .publish_await_acknowledgement(message.clone(), &topic, timeout)
                .await?;
        }
        publisher.terminate(Duration::from_secs(1)).await;
    } else {
        let publisher = service.create_direct_message_publisher_builder().build();
        publisher.start()?;
        publisher.set_publish_failure_listener(|failed| {
            error!(message_id = %failed.message_id, "publish failed: {}", failed.error);
        });
        for _ in 0..count {
            publisher.publish(message.clone(), &topic).await?;
        }
        publisher.terminate(Duration::from_secs(1)).await;
    }

    info!(count, %topic, persistent, "published");
    service.disconnect().await
}

async fn run_subscribe(
    settings: &Settings,
    subscription: &str,
    count: Option<usize>,
) -> relaymq::Result<()> {
    let service = connect(settings).await?;
    let receiver = service
        .create_direct_message_receiver_builder()
        .with_subscriptions([TopicSubscription::parse(subscription)?])
        .build();
    receiver.start().await?;

    let mut received = 0usize;
    loop {
        tokio::select! {
            next = receiver.receive_message() => {
                let message = next?;
                println!(
                    "{}: {}",
                    message.destination_name(),
                    String::from_utf8_lossy(message.payload_as_bytes())
                );
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    receiver.terminate(Duration::from_secs(1)).await;
    service.disconnect().await
}

async fn run_request(
    settings: &Settings,
    topic: &str,
    payload: &str,
    timeout: Option<Duration>,
) -> relaymq::Result<()> {
    let service = connect(settings).await?;
    let mut builder = service.create_request_reply_message_publisher_builder();
    if let Some(timeout) = timeout {
        builder = builder.with_reply_timeout(timeout);
    }
    let requester = builder.build();
    requester.start().await?;

    let request = OutboundMessageBuilder::new().build(payload);
    let reply = requester.request(request, &Topic::of(topic)).await?;
    println!("{}", String::from_utf8_lossy(reply.payload_as_bytes()));

    requester.terminate(Duration::from_secs(1)).await;
    service.disconnect().await
}

async fn run_reply(settings: &Settings, subscription: &str) -> relaymq::Result<()> {
    let service = connect(settings).await?;
    let replier = service
        .create_request_reply_message_receiver_builder()
        .build(TopicSubscription::parse(subscription)?);
    replier.start().await?;

    replier.receive_async(|request, replier| {
        let response = OutboundMessageBuilder::new().build(request.payload_as_bytes().to_vec());
        if let Err(e) = replier.reply(response) {
            error!("reply failed: {}", e);
        }
    })?;

    let _ = tokio::signal::ctrl_c().await;
    replier.terminate(Duration::from_secs(1)).await;
    service.disconnect().await
}

async fn run_hello_world(settings: &Settings) -> relaymq::Result<()> {
    let service = connect(settings).await?;

    let receiver = service
        .create_direct_message_receiver_builder()
        .with_subscriptions([TopicSubscription::parse("solace/samples/*")?])
        .build();
    receiver.start().await?;

    let publisher = service.create_direct_message_publisher_builder().build();
    publisher.start()?;
    let topic = Topic::of(format!("solace/samples/{}", service.client_name()));
    publisher
        .publish(
            OutboundMessageBuilder::new().build("Hello world"),
            &topic,
        )
        .await?;

    match receiver
        .receive_message_timeout(Duration::from_secs(5))
        .await?
    {
        Some(message) => println!(
            "received on {}: {}",
            message.destination_name(),
            message.payload_as_string().unwrap_or_default()
        ),
        None => error!("no message received"),
    }

    publisher.terminate(Duration::from_secs(1)).await;
    receiver.terminate(Duration::from_secs(1)).await;
    service.disconnect().await
}
