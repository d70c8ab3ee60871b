/********************************************************************************
 * Copyright (c) 2026 Contributors to the mqtt-queue project
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! # mqtt-queue
//!
//! Adapts a single, event-driven MQTT broker connection into a message-queue
//! abstraction supporting both pull-style consumption (peek, batched peek,
//! timed receive) and push-style consumption (one registered live receiver).
//!
//! ## This crate includes:
//!
//! - [`MqttConnectionResolver`]: resolves and validates broker endpoint and
//!   credential configuration, optionally through pluggable
//!   [`DiscoveryService`] and [`CredentialStore`] lookups
//! - [`MqttConnection`]: owns one broker session, shared by any number of
//!   logical queues, and fans incoming messages out to registered
//!   [`MessageListener`]s by topic match
//! - [`MqttMessageQueue`]: binds a logical queue name to a topic and
//!   implements send/peek/receive/listen with bounded FIFO buffering of
//!   undelivered messages
//! - the [`topic`] module implementing MQTT topic-filter matching
//! - [`LocalSessionFactory`]: an in-process loopback broker for tests and
//!   single-process wiring; real broker sessions are established via
//!   `rumqttc`
//!
//! The wire-level MQTT protocol, message acknowledgment, redelivery, locking
//! and dead-lettering are out of scope: the transport offers no such
//! primitives at this tier, and the queue's settlement operations are
//! deliberate no-ops.

mod config;
mod connection;
mod envelope;
mod error;
mod local;
mod queue;
mod rumqtt;
mod session;
pub mod topic;

pub use config::{
    ConnectionOptions, ConnectionParams, CredentialParams, CredentialStore, DiscoveryService,
    MqttConnectionResolver, DEFAULT_MQTT_PORT,
};
#[cfg(any(test, feature = "test-util"))]
pub use config::{MockCredentialStore, MockDiscoveryService};
pub use connection::{ConnectionSettings, ListenerHandle, MessageListener, MqttConnection};
pub use envelope::MessageEnvelope;
pub use error::{ConfigError, ConnectionError};
pub use local::{LocalBroker, LocalSessionFactory};
#[cfg(any(test, feature = "test-util"))]
pub use queue::MockMessageReceiver;
pub use queue::{
    MessageQueue, MessageReceiver, MqttMessageQueue, QueueSettings, MESSAGE_BUFFER_CAPACITY,
};
pub use rumqtt::RumqttSessionFactory;
pub use session::{
    IncomingMessage, MqttSession, QoS, SessionFactory, SessionHandle, SessionOptions,
};
