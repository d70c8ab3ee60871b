/********************************************************************************
 * Copyright (c) 2026 Contributors to the mqtt-queue project
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

/*!
The queue adapter binding a logical queue name to an MQTT topic.

A [`MqttMessageQueue`] turns the asynchronous message stream of a
[`MqttConnection`] into queue semantics: FIFO buffering with eviction,
blocking-with-timeout receive and an exclusive switch between buffered
consumption and one registered live receiver.
*/

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(any(test, feature = "test-util"))]
use mockall::automock;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::connection::{MessageListener, MqttConnection};
use crate::envelope::MessageEnvelope;
use crate::error::ConnectionError;
use crate::session::{IncomingMessage, QoS};
use crate::topic;

/// Maximum number of undelivered messages buffered per queue. The oldest
/// messages are evicted first once the buffer is full.
pub const MESSAGE_BUFFER_CAPACITY: usize = 1000;

/// Tunable parameters of a [`MqttMessageQueue`].
#[derive(Debug, Clone, Default)]
pub struct QueueSettings {
    /// The topic bound to the queue. Defaults to the queue name.
    pub topic: Option<String>,
    /// QoS used for publishing and subscribing.
    pub qos: QoS,
    /// Whether sent messages are published as retained messages.
    pub retain: bool,
    /// Whether the queue subscribes immediately on open instead of lazily on
    /// first consumption.
    pub autosubscribe: bool,
    /// Whether the wire payload is the full JSON-encoded envelope (`true`)
    /// or the raw envelope payload (`false`).
    pub serialize_envelope: bool,
}

impl QueueSettings {
    /// Sets the topic bound to the queue.
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    /// Sets the QoS used for publishing and subscribing.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Sets whether sent messages are published as retained messages.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Sets whether the queue subscribes immediately on open.
    pub fn with_autosubscribe(mut self, autosubscribe: bool) -> Self {
        self.autosubscribe = autosubscribe;
        self
    }

    /// Sets whether the wire payload is the full JSON-encoded envelope.
    pub fn with_serialize_envelope(mut self, serialize_envelope: bool) -> Self {
        self.serialize_envelope = serialize_envelope;
        self
    }
}

/// A push consumer receiving messages as they arrive.
#[cfg_attr(any(test, feature = "test-util"), automock)]
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Processes one delivered envelope.
    ///
    /// # Errors
    ///
    /// A returned error is logged by the queue; the message still counts as
    /// delivered and is neither re-buffered nor retried.
    async fn receive_message(
        &self,
        envelope: MessageEnvelope,
        queue_name: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The capability surface of a message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Gets the logical queue name.
    fn name(&self) -> &str;

    /// Sends an envelope into the queue.
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), ConnectionError>;

    /// Returns the oldest buffered envelope without removing it.
    async fn peek(&self) -> Result<Option<MessageEnvelope>, ConnectionError>;

    /// Returns up to `count` oldest buffered envelopes without removing them.
    async fn peek_batch(&self, count: usize) -> Result<Vec<MessageEnvelope>, ConnectionError>;

    /// Returns and removes the oldest buffered envelope, waiting up to
    /// `wait_timeout` for one to arrive.
    async fn receive(
        &self,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, ConnectionError>;

    /// Installs a live receiver, draining buffered messages to it first.
    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), ConnectionError>;

    /// Detaches the live receiver; subsequent messages resume buffering.
    async fn end_listen(&self);

    /// Acknowledges a message. The transport offers no acknowledgment
    /// primitive, so this always succeeds with no effect.
    async fn complete(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError>;

    /// Returns a message to the queue for redelivery. Always succeeds with
    /// no effect; the transport offers no redelivery primitive.
    async fn abandon(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError>;

    /// Extends a message lock. Always succeeds with no effect; the transport
    /// offers no locking primitive.
    async fn renew_lock(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError>;

    /// Moves a message to a dead-letter queue. Always succeeds with no
    /// effect; the transport offers no dead-lettering primitive.
    async fn move_to_dead_letter(&self, envelope: &MessageEnvelope)
        -> Result<(), ConnectionError>;

    /// Returns the number of currently buffered messages. This is a
    /// best-effort local count, not a broker-side count.
    async fn message_count(&self) -> Result<usize, ConnectionError>;

    /// Empties the buffer.
    async fn clear(&self);
}

struct ConsumerState {
    buffer: VecDeque<MessageEnvelope>,
    receiver: Option<Arc<dyn MessageReceiver>>,
    closed: bool,
}

/// Shared consumption state, written only by the connection's dispatch path
/// and read by the queue's own operations. Buffer mutation and the
/// buffering/live-receiving mode switch share the one lock.
struct QueueInbox {
    queue_name: String,
    serialize_envelope: bool,
    subscribed_topic: StdMutex<Option<String>>,
    state: Mutex<ConsumerState>,
    notify: Notify,
}

impl QueueInbox {
    fn new(queue_name: &str, serialize_envelope: bool) -> Arc<Self> {
        Arc::new(QueueInbox {
            queue_name: queue_name.to_string(),
            serialize_envelope,
            subscribed_topic: StdMutex::new(None),
            state: Mutex::new(ConsumerState {
                buffer: VecDeque::new(),
                receiver: None,
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    fn subscribed_topic(&self) -> Option<String> {
        self.subscribed_topic.lock().ok().and_then(|t| t.clone())
    }

    fn set_subscribed(&self, topic: String) {
        if let Ok(mut subscribed) = self.subscribed_topic.lock() {
            *subscribed = Some(topic);
        }
    }

    fn take_subscribed(&self) -> Option<String> {
        self.subscribed_topic.lock().ok().and_then(|mut t| t.take())
    }

    fn decode(&self, message: &IncomingMessage) -> Result<MessageEnvelope, serde_json::Error> {
        if self.serialize_envelope {
            MessageEnvelope::from_json(&message.payload)
        } else {
            Ok(MessageEnvelope::new(None, None, message.payload.clone()))
        }
    }
}

#[async_trait]
impl MessageListener for QueueInbox {
    async fn on_message(&self, message: IncomingMessage) {
        // exact topics are re-checked defensively; wildcard matching is the
        // broker's responsibility
        if let Some(expected) = self.subscribed_topic() {
            if !topic::contains_wildcard(&expected) && expected != message.topic {
                debug!(
                    queue = %self.queue_name,
                    topic = %message.topic,
                    "dropping message delivered for unexpected topic"
                );
                return;
            }
        }

        let envelope = match self.decode(&message) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    queue = %self.queue_name,
                    topic = %message.topic,
                    "dropping message that could not be decoded: {err}"
                );
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        if let Some(receiver) = state.receiver.clone() {
            drop(state);
            trace!(queue = %self.queue_name, envelope = %envelope, "delivering to live receiver");
            if let Err(err) = receiver.receive_message(envelope, &self.queue_name).await {
                warn!(queue = %self.queue_name, "live receiver failed to process message: {err}");
            }
        } else {
            state.buffer.push_back(envelope);
            while state.buffer.len() > MESSAGE_BUFFER_CAPACITY {
                state.buffer.pop_front();
                debug!(queue = %self.queue_name, "buffer full, evicting oldest message");
            }
            drop(state);
            self.notify.notify_waiters();
        }
    }
}

/// A message queue backed by one MQTT topic.
///
/// The queue is `Closed` until [`open`](Self::open) succeeds. Within the open
/// state the topic subscription is established lazily on first consumption
/// (or eagerly with [`QueueSettings::autosubscribe`]), and consumption
/// toggles between buffering and live receiving via [`listen`](Self::listen)
/// and [`end_listen`](Self::end_listen).
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use mqtt_queue::{
///     ConnectionParams, MessageEnvelope, MqttConnection, MqttConnectionResolver,
///     MqttMessageQueue, QueueSettings,
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let resolver = MqttConnectionResolver::default().with_connection(ConnectionParams {
///     uri: Some("mqtt://localhost:1883".to_string()),
///     ..Default::default()
/// });
/// let queue = MqttMessageQueue::new("orders", MqttConnection::new(resolver))
///     .with_settings(QueueSettings::default().with_serialize_envelope(true));
/// queue.open().await?;
///
/// queue
///     .send(MessageEnvelope::with_string_payload(
///         Some("123".to_string()),
///         Some("OrderCreated".to_string()),
///         "{\"order\": 17}",
///     ))
///     .await?;
/// if let Some(envelope) = queue.receive(Duration::from_secs(10)).await? {
///     println!("received {envelope}");
/// }
/// queue.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqttMessageQueue {
    name: String,
    settings: QueueSettings,
    connection: Arc<MqttConnection>,
    owns_connection: bool,
    inbox: Arc<QueueInbox>,
    opened: AtomicBool,
}

impl MqttMessageQueue {
    /// Creates a queue owning a private connection. The connection is opened
    /// and closed together with the queue.
    pub fn new(name: &str, connection: MqttConnection) -> Self {
        Self::build(name, Arc::new(connection), true)
    }

    /// Creates a queue on a shared, externally owned connection. The caller
    /// is responsible for opening and closing the connection.
    pub fn with_shared_connection(name: &str, connection: Arc<MqttConnection>) -> Self {
        Self::build(name, connection, false)
    }

    fn build(name: &str, connection: Arc<MqttConnection>, owns_connection: bool) -> Self {
        MqttMessageQueue {
            name: name.to_string(),
            settings: QueueSettings::default(),
            inbox: QueueInbox::new(name, false),
            connection,
            owns_connection,
            opened: AtomicBool::new(false),
        }
    }

    /// Sets the queue settings. Must be called before [`open`](Self::open),
    /// as it discards the queue's consumption state.
    ///
    /// # Panics
    ///
    /// Panics in debug builds when the queue has already been opened.
    pub fn with_settings(mut self, settings: QueueSettings) -> Self {
        debug_assert!(
            !self.is_open(),
            "queue settings cannot be changed after the queue is opened"
        );
        self.inbox = QueueInbox::new(&self.name, settings.serialize_envelope);
        self.settings = settings;
        self
    }

    /// Gets the logical queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether the queue has been opened.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Opens the queue, opening the owned connection if there is one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectFailed`] if the connection is not
    /// open afterward, or any error from opening the owned connection.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }
        if self.owns_connection {
            self.connection.open().await?;
        }
        if !self.connection.is_open().await {
            return Err(ConnectionError::connect_failed(
                "shared connection is not open",
            ));
        }

        self.inbox.state.lock().await.closed = false;
        self.opened.store(true, Ordering::Release);

        if self.settings.autosubscribe {
            self.ensure_subscribed().await?;
        }
        info!(queue = %self.name, "queue opened");
        Ok(())
    }

    /// Closes the queue: unsubscribes, clears the buffer, detaches the
    /// receiver, unblocks pending [`receive`](Self::receive) calls and
    /// closes the owned connection.
    ///
    /// # Errors
    ///
    /// Returns an error if tearing down the subscription or the owned
    /// connection fails; local state is cleaned up regardless.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if !self.opened.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(topic) = self.inbox.take_subscribed() {
            let listener: Arc<dyn MessageListener> = self.inbox.clone();
            if let Err(err) = self.connection.unsubscribe(&topic, &listener).await {
                debug!(queue = %self.name, "failed to unsubscribe while closing: {err}");
                result = Err(err);
            }
        }

        {
            let mut state = self.inbox.state.lock().await;
            state.buffer.clear();
            state.receiver = None;
            state.closed = true;
        }
        self.inbox.notify.notify_waiters();

        if self.owns_connection {
            self.connection.close().await?;
        }
        info!(queue = %self.name, "queue closed");
        result
    }

    /// Sends an envelope into the queue.
    ///
    /// The envelope is encoded according to
    /// [`QueueSettings::serialize_envelope`] and published on the queue's
    /// topic at the configured QoS and retain flag.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the queue is closed, or an
    /// error if encoding or publishing fails.
    pub async fn send(&self, envelope: MessageEnvelope) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen);
        }
        let payload = self.encode(&envelope)?;
        self.connection
            .publish(
                &self.effective_topic(),
                payload,
                self.settings.qos,
                self.settings.retain,
            )
            .await?;
        debug!(queue = %self.name, envelope = %envelope, "sent message");
        Ok(())
    }

    /// Returns the oldest buffered envelope without removing it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the queue is closed, or an
    /// error if subscribing fails.
    pub async fn peek(&self) -> Result<Option<MessageEnvelope>, ConnectionError> {
        self.ensure_subscribed().await?;
        let state = self.inbox.state.lock().await;
        Ok(state.buffer.front().cloned())
    }

    /// Returns up to `count` oldest buffered envelopes without removing
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the queue is closed, or an
    /// error if subscribing fails.
    pub async fn peek_batch(
        &self,
        count: usize,
    ) -> Result<Vec<MessageEnvelope>, ConnectionError> {
        self.ensure_subscribed().await?;
        let state = self.inbox.state.lock().await;
        Ok(state.buffer.iter().take(count).cloned().collect())
    }

    /// Returns and removes the oldest buffered envelope, waiting up to
    /// `wait_timeout` for one to arrive.
    ///
    /// Returns `None` when the timeout elapses or the queue is closed while
    /// waiting; a timeout is never an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the queue is closed, or an
    /// error if subscribing fails.
    pub async fn receive(
        &self,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, ConnectionError> {
        self.ensure_subscribed().await?;
        let deadline = tokio::time::Instant::now() + wait_timeout;
        loop {
            let notified = self.inbox.notify.notified();
            tokio::pin!(notified);
            // register for a wakeup before checking the buffer so that a
            // message arriving in between is not missed
            notified.as_mut().enable();
            {
                let mut state = self.inbox.state.lock().await;
                if let Some(envelope) = state.buffer.pop_front() {
                    return Ok(Some(envelope));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Installs `receiver` as the queue's single live consumer.
    ///
    /// Buffered messages are drained and delivered to the receiver in FIFO
    /// order before any live message. A second call replaces the previous
    /// receiver.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the queue is closed, or an
    /// error if subscribing fails.
    pub async fn listen(
        &self,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<(), ConnectionError> {
        self.ensure_subscribed().await?;
        loop {
            let mut state = self.inbox.state.lock().await;
            if state.closed {
                return Ok(());
            }
            let Some(envelope) = state.buffer.pop_front() else {
                state.receiver = Some(receiver.clone());
                break;
            };
            // deliver outside the lock; messages arriving meanwhile are
            // buffered and drained by the next iteration
            drop(state);
            if let Err(err) = receiver.receive_message(envelope, &self.name).await {
                warn!(queue = %self.name, "live receiver failed to process message: {err}");
            }
        }
        info!(queue = %self.name, "listening for messages");
        Ok(())
    }

    /// Detaches the live receiver; subsequent messages resume buffering.
    pub async fn end_listen(&self) {
        let mut state = self.inbox.state.lock().await;
        if state.receiver.take().is_some() {
            debug!(queue = %self.name, "stopped listening for messages");
        }
    }

    /// Acknowledges a message. Always succeeds with no effect, because the
    /// transport offers no acknowledgment primitive at this tier.
    pub async fn complete(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError> {
        trace!(queue = %self.name, envelope = %envelope, "complete is not supported");
        Ok(())
    }

    /// Returns a message to the queue for redelivery. Always succeeds with
    /// no effect.
    pub async fn abandon(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError> {
        trace!(queue = %self.name, envelope = %envelope, "abandon is not supported");
        Ok(())
    }

    /// Extends a message lock. Always succeeds with no effect.
    pub async fn renew_lock(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError> {
        trace!(queue = %self.name, envelope = %envelope, "renew_lock is not supported");
        Ok(())
    }

    /// Moves a message to a dead-letter queue. Always succeeds with no
    /// effect.
    pub async fn move_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<(), ConnectionError> {
        trace!(queue = %self.name, envelope = %envelope, "move_to_dead_letter is not supported");
        Ok(())
    }

    /// Returns the number of currently buffered messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the queue is closed, or an
    /// error if subscribing fails.
    pub async fn message_count(&self) -> Result<usize, ConnectionError> {
        self.ensure_subscribed().await?;
        let state = self.inbox.state.lock().await;
        Ok(state.buffer.len())
    }

    /// Empties the buffer.
    pub async fn clear(&self) {
        let mut state = self.inbox.state.lock().await;
        state.buffer.clear();
        debug!(queue = %self.name, "queue cleared");
    }

    /// Subscribes the queue's listener on the connection, once.
    async fn ensure_subscribed(&self) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotOpen);
        }
        if self.inbox.subscribed_topic().is_some() {
            return Ok(());
        }
        let topic = self.effective_topic();
        let listener: Arc<dyn MessageListener> = self.inbox.clone();
        self.connection
            .subscribe(&topic, self.settings.qos, listener)
            .await?;
        self.inbox.set_subscribed(topic.clone());
        debug!(queue = %self.name, topic = %topic, "subscribed");
        Ok(())
    }

    fn effective_topic(&self) -> String {
        self.settings
            .topic
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    fn encode(&self, envelope: &MessageEnvelope) -> Result<Bytes, ConnectionError> {
        if self.settings.serialize_envelope {
            Ok(envelope.to_json()?)
        } else {
            Ok(envelope.payload.clone())
        }
    }
}

#[async_trait]
impl MessageQueue for MqttMessageQueue {
    fn name(&self) -> &str {
        MqttMessageQueue::name(self)
    }

    async fn send(&self, envelope: MessageEnvelope) -> Result<(), ConnectionError> {
        MqttMessageQueue::send(self, envelope).await
    }

    async fn peek(&self) -> Result<Option<MessageEnvelope>, ConnectionError> {
        MqttMessageQueue::peek(self).await
    }

    async fn peek_batch(&self, count: usize) -> Result<Vec<MessageEnvelope>, ConnectionError> {
        MqttMessageQueue::peek_batch(self, count).await
    }

    async fn receive(
        &self,
        wait_timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, ConnectionError> {
        MqttMessageQueue::receive(self, wait_timeout).await
    }

    async fn listen(&self, receiver: Arc<dyn MessageReceiver>) -> Result<(), ConnectionError> {
        MqttMessageQueue::listen(self, receiver).await
    }

    async fn end_listen(&self) {
        MqttMessageQueue::end_listen(self).await
    }

    async fn complete(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError> {
        MqttMessageQueue::complete(self, envelope).await
    }

    async fn abandon(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError> {
        MqttMessageQueue::abandon(self, envelope).await
    }

    async fn renew_lock(&self, envelope: &MessageEnvelope) -> Result<(), ConnectionError> {
        MqttMessageQueue::renew_lock(self, envelope).await
    }

    async fn move_to_dead_letter(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<(), ConnectionError> {
        MqttMessageQueue::move_to_dead_letter(self, envelope).await
    }

    async fn message_count(&self) -> Result<usize, ConnectionError> {
        MqttMessageQueue::message_count(self).await
    }

    async fn clear(&self) {
        MqttMessageQueue::clear(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as TestMutex;

    use crate::config::{ConnectionParams, MqttConnectionResolver};
    use crate::connection::ConnectionSettings;
    use crate::local::{LocalBroker, LocalSessionFactory};

    fn local_connection(broker: Arc<LocalBroker>) -> MqttConnection {
        let resolver =
            MqttConnectionResolver::default().with_connection(ConnectionParams {
                protocol: Some("mqtt".to_string()),
                host: Some("localhost".to_string()),
                port: Some(1883),
                ..Default::default()
            });
        MqttConnection::new(resolver)
            .with_settings(ConnectionSettings::default().with_client_id("test-queue"))
            .with_session_factory(Arc::new(LocalSessionFactory::new(broker)))
    }

    async fn open_queue(name: &str, settings: QueueSettings) -> MqttMessageQueue {
        let broker = Arc::new(LocalBroker::default());
        let queue =
            MqttMessageQueue::new(name, local_connection(broker)).with_settings(settings);
        queue.open().await.unwrap();
        queue
    }

    fn test_envelope(text: &str) -> MessageEnvelope {
        MessageEnvelope::with_string_payload(
            Some("123".to_string()),
            Some("Test".to_string()),
            text,
        )
    }

    struct CollectingReceiver {
        received: TestMutex<Vec<MessageEnvelope>>,
    }

    impl CollectingReceiver {
        fn new() -> Arc<Self> {
            Arc::new(CollectingReceiver {
                received: TestMutex::new(Vec::new()),
            })
        }

        fn payloads(&self) -> Vec<String> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.payload_as_string())
                .collect()
        }
    }

    #[async_trait]
    impl MessageReceiver for CollectingReceiver {
        async fn receive_message(
            &self,
            envelope: MessageEnvelope,
            _queue_name: &str,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.received.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_and_receive_round_trip() {
        let queue = open_queue(
            "test",
            QueueSettings::default().with_serialize_envelope(true),
        )
        .await;
        // subscribe before sending so the loopback delivery is buffered
        assert!(queue.peek().await.unwrap().is_none());

        let sent = test_envelope("Test message");
        queue.send(sent.clone()).await.unwrap();

        let received = queue
            .receive(Duration::from_secs(10))
            .await
            .unwrap()
            .expect("a message should have been received");

        assert_eq!(received.message_type.as_deref(), Some("Test"));
        assert_eq!(received.correlation_id.as_deref(), Some("123"));
        assert_eq!(received.payload_as_string(), "Test message");
        assert_eq!(received.message_id, sent.message_id);
    }

    #[tokio::test]
    async fn test_raw_payload_mode_preserves_payload_only() {
        let queue = open_queue("test", QueueSettings::default()).await;
        assert!(queue.peek().await.unwrap().is_none());

        queue.send(test_envelope("Test message")).await.unwrap();

        let received = queue
            .receive(Duration::from_secs(10))
            .await
            .unwrap()
            .expect("a message should have been received");

        assert_eq!(received.payload_as_string(), "Test message");
        // wire payload carried no envelope metadata
        assert!(received.message_type.is_none());
        assert!(received.correlation_id.is_none());
    }

    #[tokio::test]
    async fn test_send_fails_when_closed() {
        let broker = Arc::new(LocalBroker::default());
        let queue = MqttMessageQueue::new("test", local_connection(broker));
        let result = queue.send(test_envelope("x")).await;
        assert!(matches!(result, Err(ConnectionError::NotOpen)));
    }

    #[tokio::test]
    async fn test_peek_is_non_destructive() {
        let queue = open_queue("test", QueueSettings::default()).await;

        // subscribe before sending so the loopback delivery is buffered
        assert!(queue.peek().await.unwrap().is_none());
        queue.send(test_envelope("one")).await.unwrap();
        queue.wait_for_buffered(1).await;

        let first = queue.peek().await.unwrap();
        let second = queue.peek().await.unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(queue.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_peek_batch_returns_oldest_in_order() {
        let queue = open_queue("test", QueueSettings::default()).await;
        assert!(queue.peek().await.unwrap().is_none());

        for text in ["a", "b", "c", "d"] {
            queue.send(test_envelope(text)).await.unwrap();
        }
        queue.wait_for_buffered(4).await;

        let batch = queue.peek_batch(3).await.unwrap();
        let payloads: Vec<String> =
            batch.iter().map(MessageEnvelope::payload_as_string).collect();
        assert_eq!(payloads, vec!["a", "b", "c"]);
        assert_eq!(queue.message_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_buffer_evicts_oldest_beyond_capacity() {
        let queue = open_queue("test", QueueSettings::default()).await;
        assert!(queue.peek().await.unwrap().is_none());

        for i in 0..1500 {
            queue.send(test_envelope(&i.to_string())).await.unwrap();
        }

        // wait until delivery has settled on the newest window
        for _ in 0..400 {
            let oldest = queue.peek().await.unwrap();
            if oldest.map(|e| e.payload_as_string()).as_deref() == Some("500") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            queue.message_count().await.unwrap(),
            MESSAGE_BUFFER_CAPACITY
        );
        let batch = queue.peek_batch(3).await.unwrap();
        let payloads: Vec<String> =
            batch.iter().map(MessageEnvelope::payload_as_string).collect();
        assert_eq!(payloads, vec!["500", "501", "502"]);
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let queue = open_queue("test", QueueSettings::default()).await;
        let received = queue.receive(Duration::from_millis(50)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_receive_unblocks_on_close() {
        let broker = Arc::new(LocalBroker::default());
        let queue = Arc::new(
            MqttMessageQueue::new("test", local_connection(broker)),
        );
        queue.open().await.unwrap();

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close().await.unwrap();

        let received = waiting.await.unwrap().unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_listen_drains_buffered_before_live_messages() {
        let queue = open_queue("test", QueueSettings::default()).await;
        assert!(queue.peek().await.unwrap().is_none());

        for text in ["first", "second"] {
            queue.send(test_envelope(text)).await.unwrap();
        }
        queue.wait_for_buffered(2).await;

        let receiver = CollectingReceiver::new();
        queue.listen(receiver.clone()).await.unwrap();

        queue.send(test_envelope("third")).await.unwrap();
        for _ in 0..200 {
            if receiver.payloads().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(receiver.payloads(), vec!["first", "second", "third"]);
        assert_eq!(queue.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_end_listen_resumes_buffering() {
        let queue = open_queue("test", QueueSettings::default()).await;
        let receiver = CollectingReceiver::new();
        queue.listen(receiver.clone()).await.unwrap();
        queue.end_listen().await;

        queue.send(test_envelope("buffered")).await.unwrap();
        queue.wait_for_buffered(1).await;

        assert!(receiver.payloads().is_empty());
        assert_eq!(queue.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_second_listen_replaces_receiver() {
        let queue = open_queue("test", QueueSettings::default()).await;
        let first = CollectingReceiver::new();
        let second = CollectingReceiver::new();
        queue.listen(first.clone()).await.unwrap();
        queue.listen(second.clone()).await.unwrap();

        queue.send(test_envelope("x")).await.unwrap();
        for _ in 0..200 {
            if !second.payloads().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(first.payloads().is_empty());
        assert_eq!(second.payloads(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_receiver_failure_counts_as_delivered() {
        let queue = open_queue("test", QueueSettings::default()).await;

        let mut receiver = MockMessageReceiver::new();
        receiver
            .expect_receive_message()
            .returning(|_, _| Err("boom".into()));
        queue.listen(Arc::new(receiver)).await.unwrap();

        queue.send(test_envelope("x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // the failed delivery is not re-buffered
        assert_eq!(queue.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_settlement_operations_are_no_ops() {
        let queue = open_queue("test", QueueSettings::default()).await;
        assert!(queue.peek().await.unwrap().is_none());
        queue.send(test_envelope("x")).await.unwrap();
        queue.wait_for_buffered(1).await;

        let envelope = queue.peek().await.unwrap().unwrap();
        queue.complete(&envelope).await.unwrap();
        queue.abandon(&envelope).await.unwrap();
        queue.renew_lock(&envelope).await.unwrap();
        queue.move_to_dead_letter(&envelope).await.unwrap();

        // no observable state change
        assert_eq!(queue.message_count().await.unwrap(), 1);
        assert_eq!(queue.peek().await.unwrap(), Some(envelope));
    }

    #[tokio::test]
    async fn test_decode_failure_drops_message() {
        let broker = Arc::new(LocalBroker::default());
        let queue = MqttMessageQueue::new("test", local_connection(broker.clone()))
            .with_settings(QueueSettings::default().with_serialize_envelope(true));
        queue.open().await.unwrap();
        assert!(queue.peek().await.unwrap().is_none());

        // raw garbage cannot be decoded as a serialized envelope
        broker
            .publish("test", Bytes::from_static(b"not json"), QoS::AtMostOnce, false)
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exact_topic_refilter_drops_foreign_topic() {
        let broker = Arc::new(LocalBroker::default());
        // a second queue on the same connection subscribes a wildcard overlapping
        // the first queue's exact topic
        let connection = Arc::new(local_connection(broker));
        connection.open().await.unwrap();

        let exact = MqttMessageQueue::with_shared_connection("events/a", connection.clone());
        let wildcard = MqttMessageQueue::with_shared_connection("wild", connection.clone())
            .with_settings(QueueSettings::default().with_topic("events/+"));
        exact.open().await.unwrap();
        wildcard.open().await.unwrap();
        assert!(exact.peek().await.unwrap().is_none());
        assert!(wildcard.peek().await.unwrap().is_none());

        connection
            .publish("events/b", Bytes::from_static(b"x"), QoS::AtMostOnce, false)
            .await
            .unwrap();
        wildcard.wait_for_buffered(1).await;

        // the exact queue never buffers the foreign topic's message
        assert_eq!(exact.message_count().await.unwrap(), 0);
        assert_eq!(wildcard.message_count().await.unwrap(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "queue settings cannot be changed")]
    async fn test_with_settings_rejects_open_queue() {
        let broker = Arc::new(LocalBroker::default());
        let queue = MqttMessageQueue::new("test", local_connection(broker));
        queue.open().await.unwrap();
        let _ = queue.with_settings(QueueSettings::default());
    }

    #[tokio::test]
    async fn test_clear_empties_buffer() {
        let queue = open_queue("test", QueueSettings::default()).await;
        assert!(queue.peek().await.unwrap().is_none());
        queue.send(test_envelope("x")).await.unwrap();
        queue.wait_for_buffered(1).await;

        queue.clear().await;
        assert_eq!(queue.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_autosubscribe_buffers_without_prior_consumption() {
        let broker = Arc::new(LocalBroker::default());
        let queue = MqttMessageQueue::new("test", local_connection(broker.clone()))
            .with_settings(QueueSettings::default().with_autosubscribe(true));
        queue.open().await.unwrap();

        broker
            .publish("test", Bytes::from_static(b"early"), QoS::AtMostOnce, false)
            .await;
        queue.wait_for_buffered(1).await;

        let received = queue.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.unwrap().payload_as_string(), "early");
    }

    impl MqttMessageQueue {
        /// Waits until at least `count` messages are buffered.
        async fn wait_for_buffered(&self, count: usize) {
            for _ in 0..400 {
                if self.inbox.state.lock().await.buffer.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("queue did not buffer {count} messages in time");
        }
    }

    #[tokio::test]
    async fn test_inbox_refilters_exact_topic() {
        let inbox = QueueInbox::new("test", false);
        inbox.set_subscribed("events/a".to_string());

        inbox
            .on_message(IncomingMessage {
                topic: "events/b".to_string(),
                payload: Bytes::from_static(b"foreign"),
                qos: QoS::AtMostOnce,
                retain: false,
                dup: false,
            })
            .await;
        assert!(inbox.state.lock().await.buffer.is_empty());

        inbox
            .on_message(IncomingMessage {
                topic: "events/a".to_string(),
                payload: Bytes::from_static(b"mine"),
                qos: QoS::AtMostOnce,
                retain: false,
                dup: false,
            })
            .await;
        assert_eq!(inbox.state.lock().await.buffer.len(), 1);
    }
}
