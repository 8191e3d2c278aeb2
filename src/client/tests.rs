use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use super::{AcknowledgeMode, Connection, ConnectionState, ListenerError, Session};
use crate::broker::{Broker, Message};
use crate::config::BrokerSettings;
use crate::utils::BrokerError;

const GRACE: Duration = Duration::from_millis(500);
const QUIET: Duration = Duration::from_millis(50);

fn started_session(broker: &Broker) -> (Connection, Session) {
    let connection = broker.create_connection();
    connection.start().unwrap();
    let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
    (connection, session)
}

#[test]
fn test_connection_lifecycle() {
    let broker = Broker::new();
    let connection = Connection::create(&broker);
    assert_eq!(connection.state(), ConnectionState::Created);

    connection.start().unwrap();
    connection.start().unwrap();
    assert_eq!(connection.state(), ConnectionState::Started);

    connection.stop().unwrap();
    assert_eq!(connection.state(), ConnectionState::Stopped);
    connection.start().unwrap();
    assert_eq!(connection.state(), ConnectionState::Started);

    connection.close();
    connection.close();
    assert!(connection.is_closed());
    assert!(matches!(
        connection.start(),
        Err(BrokerError::InvalidState(_))
    ));
    assert!(matches!(connection.stop(), Err(BrokerError::InvalidState(_))));
}

#[test]
fn test_create_session_on_closed_connection_fails() {
    let broker = Broker::new();
    let connection = broker.create_connection();
    let session = connection.create_session(AcknowledgeMode::Client).unwrap();
    assert_eq!(session.acknowledge_mode(), AcknowledgeMode::Client);
    assert_eq!(connection.session_count(), 1);

    connection.close();
    assert!(session.is_closed());
    assert_eq!(connection.session_count(), 0);
    assert!(matches!(
        connection.create_session(AcknowledgeMode::Auto),
        Err(BrokerError::InvalidState(_))
    ));
}

#[test]
fn test_send_requires_started_connection() {
    let broker = Broker::new();
    let connection = broker.create_connection();
    let session = connection.create_session(AcknowledgeMode::Auto).unwrap();
    let topic = session.create_topic("historiales");
    let producer = session.create_producer(&topic).unwrap();

    assert!(matches!(
        producer.send("too early"),
        Err(BrokerError::InvalidState(_))
    ));

    connection.start().unwrap();
    producer.send("on time").unwrap();

    connection.stop().unwrap();
    assert!(matches!(
        producer.send("paused"),
        Err(BrokerError::InvalidState(_))
    ));

    connection.close();
    assert!(matches!(
        producer.send("too late"),
        Err(BrokerError::InvalidState(_))
    ));
    assert_eq!(broker.stats().published, 1);
}

#[test]
fn test_closed_producer_rejects_send() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let producer = session.create_producer(&topic).unwrap();

    producer.close();
    assert!(producer.is_closed());
    assert!(matches!(
        producer.send("nope"),
        Err(BrokerError::InvalidState(_))
    ));
}

#[test]
fn test_dropped_producers_are_not_kept_by_the_session() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");

    for _ in 0..1000 {
        let producer = session.create_producer(&topic).unwrap();
        drop(producer);
    }
    assert!(session.tracked_producers() <= 1);

    let producer = session.create_producer(&topic).unwrap();
    assert_eq!(session.tracked_producers(), 1);
    producer.send("still works").unwrap();
}

#[test]
fn test_listener_outside_a_runtime_is_rejected() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");

    let result = session
        .create_consumer_with_listener(&topic, |_: &Message| -> Result<(), ListenerError> {
            Ok(())
        });

    assert!(matches!(result, Err(BrokerError::InvalidState(_))));
    assert_eq!(topic.subscriber_count(), 0);
}

#[tokio::test]
async fn test_pull_consumer_receives_in_send_order_then_blocks() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();
    let producer = session.create_producer(&topic).unwrap();

    producer.send("alpha").unwrap();
    producer.send("beta").unwrap();

    assert_eq!(consumer.receive().await.unwrap().text(), "alpha");
    assert_eq!(consumer.receive().await.unwrap().text(), "beta");
    assert_eq!(
        consumer.receive_timeout(QUIET).await,
        Err(BrokerError::Timeout)
    );
}

#[tokio::test]
async fn test_late_consumer_never_sees_earlier_message() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let producer = session.create_producer(&topic).unwrap();

    producer.send("gamma").unwrap();
    let consumer = session.create_consumer(&topic).unwrap();

    assert_eq!(
        consumer.receive_timeout(QUIET).await,
        Err(BrokerError::Timeout)
    );
    assert_eq!(broker.stats().dropped, 1);
}

#[tokio::test]
async fn test_two_consumers_each_get_every_message() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let first = session.create_consumer(&topic).unwrap();
    let second = session.create_consumer(&topic).unwrap();
    let producer = session.create_producer(&topic).unwrap();

    for text in ["one", "two", "three"] {
        producer.send(text).unwrap();
    }

    for consumer in [&first, &second] {
        let mut texts = Vec::new();
        for _ in 0..3 {
            texts.push(consumer.receive().await.unwrap().payload);
        }
        assert_eq!(texts, vec!["one", "two", "three"]);
    }
}

#[tokio::test]
async fn test_connection_close_unblocks_receive() {
    let broker = Broker::new();
    let (connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();

    let waiting = tokio::spawn(async move { consumer.receive().await });
    tokio::time::sleep(QUIET).await;
    connection.close();

    let result = timeout(GRACE, waiting)
        .await
        .expect("receive did not return after close")
        .unwrap();
    assert_eq!(result, Err(BrokerError::ConnectionClosed));
    assert_eq!(topic.subscriber_count(), 0);
}

#[tokio::test]
async fn test_consumer_close_unblocks_receive() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = Arc::new(session.create_consumer(&topic).unwrap());

    let waiting = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.receive().await })
    };
    tokio::time::sleep(QUIET).await;
    consumer.close();

    let result = timeout(GRACE, waiting).await.unwrap().unwrap();
    assert_eq!(result, Err(BrokerError::ConsumerClosed));
    assert_eq!(consumer.receive().await, Err(BrokerError::ConsumerClosed));
}

#[tokio::test]
async fn test_session_close_unblocks_receive_and_closes_members() {
    let broker = Broker::new();
    let (connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();
    let producer = session.create_producer(&topic).unwrap();

    let waiting = tokio::spawn(async move { consumer.receive().await });
    tokio::time::sleep(QUIET).await;
    session.close();

    let result = timeout(GRACE, waiting).await.unwrap().unwrap();
    assert_eq!(result, Err(BrokerError::ConsumerClosed));
    assert!(producer.is_closed());
    assert_eq!(connection.session_count(), 0);
    assert!(matches!(
        session.create_consumer(&topic),
        Err(BrokerError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_queued_messages_are_discarded_on_close() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();
    let producer = session.create_producer(&topic).unwrap();

    producer.send("in flight").unwrap();
    consumer.close();

    assert_eq!(consumer.receive().await, Err(BrokerError::ConsumerClosed));
    assert_eq!(consumer.receive_no_wait(), Err(BrokerError::ConsumerClosed));
}

#[tokio::test]
async fn test_messages_wait_for_connection_start() {
    let broker = Broker::new();
    let publisher = broker.create_connection();
    publisher.start().unwrap();
    let pub_session = publisher.create_session(AcknowledgeMode::Auto).unwrap();
    let topic = pub_session.create_topic("historiales");
    let producer = pub_session.create_producer(&topic).unwrap();

    let subscriber = broker.create_connection();
    let sub_session = subscriber.create_session(AcknowledgeMode::Auto).unwrap();
    let consumer = sub_session.create_consumer(&topic).unwrap();

    producer.send("queued").unwrap();
    assert_eq!(consumer.receive_no_wait(), Ok(None));
    assert_eq!(
        consumer.receive_timeout(QUIET).await,
        Err(BrokerError::Timeout)
    );

    subscriber.start().unwrap();
    assert_eq!(consumer.receive().await.unwrap().text(), "queued");

    subscriber.stop().unwrap();
    producer.send("held").unwrap();
    assert_eq!(
        consumer.receive_timeout(QUIET).await,
        Err(BrokerError::Timeout)
    );

    subscriber.start().unwrap();
    assert_eq!(consumer.receive().await.unwrap().text(), "held");
}

#[tokio::test]
async fn test_receive_no_wait() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();
    let producer = session.create_producer(&topic).unwrap();

    assert_eq!(consumer.receive_no_wait(), Ok(None));
    producer.send("ready").unwrap();
    let message = consumer.receive_no_wait().unwrap().unwrap();
    assert_eq!(message.text(), "ready");
    assert_eq!(message.sequence, 1);
}

#[tokio::test]
async fn test_listener_receives_in_order() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumer = session
        .create_consumer_with_listener(
            &topic,
            move |message: &Message| -> Result<(), ListenerError> {
                tx.send(message.payload.clone())?;
                Ok(())
            },
        )
        .unwrap();
    assert!(consumer.has_listener());

    let producer = session.create_producer(&topic).unwrap();
    for i in 0..20 {
        producer.send(format!("msg-{i}")).unwrap();
    }

    for i in 0..20 {
        let text = timeout(GRACE, rx.recv()).await.unwrap().unwrap();
        assert_eq!(text, format!("msg-{i}"));
    }
}

#[tokio::test]
async fn test_listener_is_paused_while_stopped() {
    let broker = Broker::new();
    let (subscriber, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _consumer = session
        .create_consumer_with_listener(
            &topic,
            move |message: &Message| -> Result<(), ListenerError> {
                tx.send(message.payload.clone())?;
                Ok(())
            },
        )
        .unwrap();
    subscriber.stop().unwrap();

    let (_publisher, pub_session) = started_session(&broker);
    let producer = pub_session.create_producer(&topic).unwrap();
    producer.send("held").unwrap();

    tokio::time::sleep(QUIET).await;
    assert!(rx.try_recv().is_err());

    subscriber.start().unwrap();
    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap().unwrap(), "held");
}

#[tokio::test(flavor = "current_thread")]
async fn test_listener_does_not_run_on_the_sending_task() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let ran = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let flag = Arc::clone(&ran);
    let _consumer = session
        .create_consumer_with_listener(
            &topic,
            move |message: &Message| -> Result<(), ListenerError> {
                flag.store(true, Ordering::SeqCst);
                tx.send(message.payload.clone())?;
                Ok(())
            },
        )
        .unwrap();
    let producer = session.create_producer(&topic).unwrap();

    // Single-threaded runtime: the listener can only run once this task
    // yields, so `send` must have returned without calling it.
    producer.send("hello").unwrap();
    assert!(!ran.load(Ordering::SeqCst));

    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap().unwrap(), "hello");
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_receive_on_listener_consumer_is_invalid() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session
        .create_consumer_with_listener(&topic, |_: &Message| -> Result<(), ListenerError> {
            Ok(())
        })
        .unwrap();

    assert!(matches!(
        consumer.receive().await,
        Err(BrokerError::InvalidState(_))
    ));
    assert!(matches!(
        consumer.receive_no_wait(),
        Err(BrokerError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_failing_listener_does_not_block_others() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");

    let _failing = session
        .create_consumer_with_listener(&topic, |_: &Message| -> Result<(), ListenerError> {
            Err("listener rejected the message".into())
        })
        .unwrap();
    let _panicking = session
        .create_consumer_with_listener(&topic, |_: &Message| -> Result<(), ListenerError> {
            panic!("listener blew up")
        })
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _healthy = session
        .create_consumer_with_listener(
            &topic,
            move |message: &Message| -> Result<(), ListenerError> {
                tx.send(message.payload.clone())?;
                Ok(())
            },
        )
        .unwrap();

    let producer = session.create_producer(&topic).unwrap();
    producer.send("first").unwrap();
    producer.send("second").unwrap();

    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap().unwrap(), "first");
    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap().unwrap(), "second");

    // Give the failing listeners time to run; each saw both messages.
    let deadline = tokio::time::Instant::now() + GRACE;
    while broker.stats().callback_failures < 4 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(broker.stats().callback_failures, 4);
}

#[tokio::test]
async fn test_closed_listener_gets_nothing_more() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumer = session
        .create_consumer_with_listener(
            &topic,
            move |message: &Message| -> Result<(), ListenerError> {
                tx.send(message.payload.clone())?;
                Ok(())
            },
        )
        .unwrap();
    let producer = session.create_producer(&topic).unwrap();

    producer.send("before").unwrap();
    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap().unwrap(), "before");

    consumer.close();
    producer.send("after").unwrap();

    // The listener task exits and drops its sender, closing the channel.
    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap(), None);
}

#[tokio::test]
async fn test_close_gracefully_waits_for_listeners() {
    let broker = Broker::new();
    let (connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let _consumer = session
        .create_consumer_with_listener(
            &topic,
            move |message: &Message| -> Result<(), ListenerError> {
                tx.send(message.payload.clone())?;
                Ok(())
            },
        )
        .unwrap();

    connection.close_gracefully().await;

    assert!(connection.is_closed());
    assert_eq!(timeout(GRACE, rx.recv()).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_gracefully_waits_for_a_running_callback() {
    let broker = Broker::with_settings(BrokerSettings {
        close_grace_ms: 1000,
    });
    let (connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let finished = Arc::new(AtomicBool::new(false));
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let done = Arc::clone(&finished);
    let _consumer = session
        .create_consumer_with_listener(
            &topic,
            move |_: &Message| -> Result<(), ListenerError> {
                started_tx.send(())?;
                std::thread::sleep(Duration::from_millis(150));
                done.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .unwrap();
    let producer = session.create_producer(&topic).unwrap();
    producer.send("slow").unwrap();

    timeout(GRACE, started_rx.recv()).await.unwrap().unwrap();
    assert!(!finished.load(Ordering::SeqCst));

    connection.close_gracefully().await;
    assert!(finished.load(Ordering::SeqCst));
    assert!(connection.is_closed());
}

#[tokio::test]
async fn test_dropping_connection_closes_it() {
    let broker = Broker::new();
    let (connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();

    drop(connection);

    assert!(session.is_closed());
    assert_eq!(consumer.receive().await, Err(BrokerError::ConnectionClosed));
}

#[tokio::test]
async fn test_dropping_consumer_unregisters_it() {
    let broker = Broker::new();
    let (_connection, session) = started_session(&broker);
    let topic = session.create_topic("historiales");
    let consumer = session.create_consumer(&topic).unwrap();
    assert_eq!(topic.subscriber_count(), 1);

    drop(consumer);
    assert_eq!(topic.subscriber_count(), 0);
}
