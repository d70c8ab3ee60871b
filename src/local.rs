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
An in-process loopback broker.

Sessions created by the [`LocalSessionFactory`] exchange messages within a
single process: every publish is routed to all sessions holding a matching
topic-filter subscription, applying full MQTT wildcard semantics. Useful for
wiring co-located components and for testing without a broker.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::ConnectionError;
use crate::session::{IncomingMessage, MqttSession, QoS, SessionFactory, SessionHandle, SessionOptions};
use crate::topic;

const INCOMING_CHANNEL_CAPACITY: usize = 1024;

struct LocalSubscriber {
    session_id: u64,
    filters: Vec<String>,
    tx: mpsc::Sender<IncomingMessage>,
}

/// An in-process message broker routing publishes to subscribed sessions.
#[derive(Default)]
pub struct LocalBroker {
    subscribers: Mutex<Vec<LocalSubscriber>>,
    next_session_id: AtomicU64,
}

impl LocalBroker {
    async fn register(&self, tx: mpsc::Sender<IncomingMessage>) -> u64 {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().await.push(LocalSubscriber {
            session_id,
            filters: Vec::new(),
            tx,
        });
        session_id
    }

    async fn subscribe(&self, session_id: u64, filter: &str) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(subscriber) = subscribers.iter_mut().find(|s| s.session_id == session_id) {
            if !subscriber.filters.iter().any(|f| f == filter) {
                subscriber.filters.push(filter.to_string());
            }
        }
    }

    async fn unsubscribe(&self, session_id: u64, filter: &str) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(subscriber) = subscribers.iter_mut().find(|s| s.session_id == session_id) {
            subscriber.filters.retain(|f| f != filter);
        }
    }

    async fn remove(&self, session_id: u64) {
        self.subscribers
            .lock()
            .await
            .retain(|s| s.session_id != session_id);
    }

    /// Routes a publish to every session holding a matching filter.
    ///
    /// Exposed so tests can inject raw messages without going through a
    /// session.
    pub async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        let targets: Vec<mpsc::Sender<IncomingMessage>> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .iter()
                .filter(|s| s.filters.iter().any(|f| topic::matches(f, topic)))
                .map(|s| s.tx.clone())
                .collect()
        };
        for tx in targets {
            let message = IncomingMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                retain,
                dup: false,
            };
            // a closed stream means the session is gone, nothing to deliver
            if tx.send(message).await.is_err() {
                debug!(topic = %topic, "dropping message for closed local session");
            }
        }
    }
}

/// A [`SessionFactory`] creating sessions attached to a [`LocalBroker`].
///
/// All sessions created by factories sharing the same broker exchange
/// messages with each other.
#[derive(Default)]
pub struct LocalSessionFactory {
    broker: Arc<LocalBroker>,
}

impl LocalSessionFactory {
    /// Creates a factory attached to the given broker.
    pub fn new(broker: Arc<LocalBroker>) -> Self {
        LocalSessionFactory { broker }
    }

    /// Gets the broker this factory attaches sessions to.
    pub fn broker(&self) -> Arc<LocalBroker> {
        self.broker.clone()
    }
}

#[async_trait]
impl SessionFactory for LocalSessionFactory {
    async fn connect(&self, options: &SessionOptions) -> Result<SessionHandle, ConnectionError> {
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let session_id = self.broker.register(tx).await;
        debug!(client_id = %options.client_id, session_id, "local session established");
        Ok(SessionHandle {
            session: Arc::new(LocalSession {
                broker: self.broker.clone(),
                session_id,
            }),
            incoming: rx,
        })
    }
}

struct LocalSession {
    broker: Arc<LocalBroker>,
    session_id: u64,
}

#[async_trait]
impl MqttSession for LocalSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        self.broker.publish(topic, payload, qos, retain).await;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        let _ = qos;
        self.broker.subscribe(self.session_id, topic).await;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.broker.unsubscribe(self.session_id, topic).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.broker.remove(self.session_id).await;
        Ok(())
    }
}
