//! Demo run of the broker.
//!
//! Plays a publisher, a synchronous subscriber and an asynchronous
//! subscriber against the `historiales` topic inside one process.

use std::time::Duration;

use topicmq::config::load_config;
use topicmq::utils::logging;
use topicmq::{AcknowledgeMode, Broker, ListenerError, Message};
use tracing::{error, info};

const TOPIC: &str = "historiales";
const HISTORY: &str = "<history><patient><name>Manolo García</name></patient></history>";

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return;
        }
    };
    logging::init(&config.logging.level);

    if let Err(e) = run(Broker::with_settings(config.broker)).await {
        error!("Demo failed: {e}");
    }
}

async fn run(broker: Broker) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = broker.create_connection();
    subscriber.start()?;
    let session = subscriber.create_session(AcknowledgeMode::Auto)?;
    let topic = session.create_topic(TOPIC);

    let sync_consumer = session.create_consumer(&topic)?;
    let _async_consumer = session.create_consumer_with_listener(
        &topic,
        |message: &Message| -> Result<(), ListenerError> {
            info!("Listener received message '{}'", message.text());
            Ok(())
        },
    )?;

    let publisher = broker.create_connection();
    publisher.start()?;
    let pub_session = publisher.create_session(AcknowledgeMode::Auto)?;
    let producer = pub_session.create_producer(&pub_session.create_topic(TOPIC))?;
    producer.send(HISTORY)?;
    info!("Sent message '{HISTORY}'");
    publisher.close();

    let message = sync_consumer.receive_timeout(Duration::from_secs(5)).await?;
    info!("Received message {}", serde_json::to_string(&message)?);

    subscriber.close_gracefully().await;
    info!("Dispatch stats: {}", serde_json::to_string(&broker.stats())?);
    Ok(())
}
