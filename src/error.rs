/********************************************************************************
 * Copyright (c) 2026 Contributors to the mqtt-queue project
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use thiserror::Error;

/// An error indicating missing or contradictory connection configuration.
///
/// These errors are fatal to [`resolve`](crate::MqttConnectionResolver::resolve)
/// and [`open`](crate::MqttConnection::open) and are never retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No connection parameters have been configured at all.
    #[error("connection parameters are not configured")]
    NoConnection,
    /// The connection protocol is missing and no full URI has been supplied.
    #[error("connection protocol is not configured")]
    NoProtocol,
    /// The connection host is missing and no full URI has been supplied.
    #[error("connection host is not configured")]
    NoHost,
    /// The connection port is missing or zero and no full URI has been supplied.
    #[error("connection port is not configured")]
    NoPort,
    /// The configured broker URI cannot be parsed.
    #[error("broker URI is malformed: {0}")]
    MalformedUri(String),
}

/// An error indicating a problem with the broker connection or with an
/// operation attempted on it.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The broker session could not be established within the connect timeout.
    #[error("failed to connect to MQTT broker: {cause}")]
    ConnectFailed {
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The operation requires an open connection or queue.
    #[error("connection is not open")]
    NotOpen,
    /// A broker request (publish, subscribe, unsubscribe, disconnect) failed.
    #[error("broker request failed: {0}")]
    Broker(String),
    /// A message envelope could not be encoded for sending.
    #[error("failed to encode message envelope: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnectionError {
    /// Creates a [`ConnectionError::ConnectFailed`] wrapping the given cause.
    pub fn connect_failed<E>(cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        ConnectionError::ConnectFailed {
            cause: cause.into(),
        }
    }
}
