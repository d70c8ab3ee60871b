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
The transport boundary towards the MQTT broker client.

Everything below this seam is delegated to a broker client library: wire
framing, CONNECT/PUBLISH/SUBSCRIBE encoding and TLS. The connection manager
only ever talks to a [`SessionFactory`] which yields an established
[`MqttSession`] together with the session's single incoming-message stream.
*/

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// MQTT delivery guarantee level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce,
    /// At least once delivery.
    AtLeastOnce,
    /// Exactly once delivery.
    ExactlyOnce,
}

impl QoS {
    /// Returns the numeric MQTT QoS level (0-2).
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level: {other}")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos.level()
    }
}

/// A message delivered by the broker on the session's incoming stream.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The topic the message was published under.
    pub topic: String,
    /// The raw message payload.
    pub payload: Bytes,
    /// The QoS level the message was delivered with.
    pub qos: QoS,
    /// Whether the message was a retained message.
    pub retain: bool,
    /// Whether the message is a redelivery of an earlier publish.
    pub dup: bool,
}

/// Parameters for establishing one broker session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// User name for broker authentication.
    pub username: Option<String>,
    /// Password for broker authentication.
    pub password: Option<String>,
    /// Keep-alive interval of the session.
    pub keep_alive: Duration,
    /// Whether to keep re-establishing the session after it is lost.
    pub retry_connect: bool,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

/// An established broker session.
///
/// Implementations must be safe to share between tasks; all operations take
/// `&self`.
#[async_trait]
pub trait MqttSession: Send + Sync {
    /// Publishes a payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker request fails.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError>;

    /// Subscribes the session to a topic filter.
    ///
    /// Subscribing to the same filter more than once is permitted and has no
    /// additional effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker request fails.
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ConnectionError>;

    /// Removes a topic-filter subscription from the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker request fails.
    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    /// Tears down the session.
    ///
    /// After this call the session's incoming-message stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker request fails.
    async fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// An established session together with its incoming-message stream.
pub struct SessionHandle {
    /// The session to issue broker requests on.
    pub session: std::sync::Arc<dyn MqttSession>,
    /// The single stream of messages delivered by the broker.
    pub incoming: mpsc::Receiver<IncomingMessage>,
}

/// A factory for establishing broker sessions.
///
/// The [`connect`](SessionFactory::connect) call resolves once the broker has
/// acknowledged the connection; the caller is responsible for enforcing a
/// deadline around it.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Establishes one broker session.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectFailed`] if the session cannot be
    /// established, wrapping the underlying cause.
    async fn connect(&self, options: &SessionOptions) -> Result<SessionHandle, ConnectionError>;
}
