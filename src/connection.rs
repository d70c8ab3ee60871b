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
The connection manager owning one broker session.

A [`MqttConnection`] resolves its endpoint configuration, establishes a single
session through a [`SessionFactory`] and fans the session's incoming-message
stream out to registered listeners by topic match. Multiple logical queues
share one connection by registering their listeners on it.
*/

use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ConnectionOptions, MqttConnectionResolver};
use crate::error::ConnectionError;
use crate::rumqtt::RumqttSessionFactory;
use crate::session::{IncomingMessage, MqttSession, QoS, SessionFactory, SessionOptions};
use crate::topic;

/// A listener for messages delivered on subscribed topics.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Invoked once for every delivered message whose topic matches the
    /// listener's subscription.
    ///
    /// Implementations handle their own failures; a misbehaving listener
    /// never aborts the dispatch loop.
    async fn on_message(&self, message: IncomingMessage);
}

/// A wrapper type that allows comparing [`MessageListener`]s to each other by
/// identity, so that the same listener can be unregistered again.
#[derive(Clone)]
pub struct ListenerHandle {
    listener: Arc<dyn MessageListener>,
}

impl ListenerHandle {
    /// Wraps the given listener.
    pub fn new(listener: Arc<dyn MessageListener>) -> Self {
        ListenerHandle { listener }
    }
}

impl Deref for ListenerHandle {
    type Target = dyn MessageListener;

    fn deref(&self) -> &Self::Target {
        &*self.listener
    }
}

impl Hash for ListenerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.listener).hash(state);
    }
}

impl PartialEq for ListenerHandle {
    /// Two handles are equal if they point to the same listener instance.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.listener, &other.listener)
    }
}

impl Eq for ListenerHandle {}

/// Tunable parameters of a [`MqttConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Client identifier presented to the broker. Defaults to the local host
    /// name, falling back to a generated identifier.
    pub client_id: Option<String>,
    /// Whether to keep re-establishing the session after it is lost.
    pub retry_connect: bool,
    /// Hard deadline for establishing the session.
    pub connect_timeout: Duration,
    /// Delay between reconnect attempts.
    pub reconnect_timeout: Duration,
    /// Keep-alive interval of the session.
    pub keep_alive: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            client_id: None,
            retry_connect: true,
            connect_timeout: Duration::from_secs(30),
            reconnect_timeout: Duration::from_secs(1),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl ConnectionSettings {
    /// Sets the client identifier.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    /// Sets whether to reconnect after the session is lost.
    pub fn with_retry_connect(mut self, retry_connect: bool) -> Self {
        self.retry_connect = retry_connect;
        self
    }

    /// Sets the hard deadline for establishing the session.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the delay between reconnect attempts.
    pub fn with_reconnect_timeout(mut self, reconnect_timeout: Duration) -> Self {
        self.reconnect_timeout = reconnect_timeout;
        self
    }

    /// Sets the keep-alive interval of the session.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

struct TopicSubscription {
    topic: String,
    exact: bool,
    listener: ListenerHandle,
}

struct OpenState {
    session: Arc<dyn MqttSession>,
    dispatcher: JoinHandle<()>,
}

/// A manager owning one broker session shared by any number of listeners.
///
/// The connection is `Closed` until [`open`](Self::open) succeeds and
/// `Closed` again after [`close`](Self::close); no intermediate states are
/// exposed.
pub struct MqttConnection {
    resolver: MqttConnectionResolver,
    settings: ConnectionSettings,
    factory: Arc<dyn SessionFactory>,
    subscriptions: Arc<RwLock<Vec<TopicSubscription>>>,
    state: Mutex<Option<OpenState>>,
}

impl MqttConnection {
    /// Creates a connection manager resolving its endpoint through the given
    /// resolver and connecting via `rumqttc`.
    pub fn new(resolver: MqttConnectionResolver) -> Self {
        MqttConnection {
            resolver,
            settings: ConnectionSettings::default(),
            factory: Arc::new(RumqttSessionFactory::default()),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            state: Mutex::new(None),
        }
    }

    /// Sets the connection settings.
    pub fn with_settings(mut self, settings: ConnectionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replaces the session factory, e.g. with a
    /// [`LocalSessionFactory`](crate::LocalSessionFactory).
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Checks whether a live session exists.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Establishes the broker session. A no-op when already open.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`](crate::ConfigError) if the connection
    /// parameters cannot be resolved, or
    /// [`ConnectionError::ConnectFailed`] if the session is not established
    /// within the configured connect timeout.
    pub async fn open(&self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }

        let options = self.resolver.resolve().await?;
        let session_options = self.session_options(&options);

        let handle = tokio::time::timeout(
            self.settings.connect_timeout,
            self.factory.connect(&session_options),
        )
        .await
        .map_err(|_| {
            ConnectionError::connect_failed(format!(
                "connect to {} timed out after {:?}",
                options.uri, self.settings.connect_timeout
            ))
        })??;

        let dispatcher = tokio::spawn(dispatch(handle.incoming, self.subscriptions.clone()));
        info!(
            uri = %options.uri,
            client_id = %session_options.client_id,
            "connected to MQTT broker"
        );
        *state = Some(OpenState {
            session: handle.session,
            dispatcher,
        });
        Ok(())
    }

    /// Tears down the session and drops all subscriptions. A no-op when
    /// already closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker disconnect request fails; local state
    /// is cleaned up regardless.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let Some(open) = self.state.lock().await.take() else {
            return Ok(());
        };
        let result = open.session.disconnect().await;
        open.dispatcher.abort();
        self.subscriptions.write().await.clear();
        info!("MQTT connection closed");
        result
    }

    /// Publishes a payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the connection is closed, or
    /// an error if the broker request fails.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        let session = self.current_session().await.ok_or(ConnectionError::NotOpen)?;
        session.publish(topic, payload, qos, retain).await
    }

    /// Subscribes a listener to a topic filter.
    ///
    /// Issues a broker-level subscribe (idempotent) and registers the
    /// listener locally. Registering the same listener for the same topic a
    /// second time has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotOpen`] when the connection is closed, or
    /// an error if the broker request fails.
    pub async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), ConnectionError> {
        let session = self.current_session().await.ok_or(ConnectionError::NotOpen)?;
        session.subscribe(topic, qos).await?;

        let handle = ListenerHandle::new(listener);
        let mut subscriptions = self.subscriptions.write().await;
        let already_registered = subscriptions
            .iter()
            .any(|s| s.topic == topic && s.listener == handle);
        if !already_registered {
            subscriptions.push(TopicSubscription {
                topic: topic.to_string(),
                exact: !topic::contains_wildcard(topic),
                listener: handle,
            });
            debug!(topic = %topic, "listener subscribed");
        }
        Ok(())
    }

    /// Removes a listener's subscription for a topic.
    ///
    /// A broker-level unsubscribe is only issued when no other listener
    /// remains bound to the topic. A no-op when the session is already
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker unsubscribe request fails.
    pub async fn unsubscribe(
        &self,
        topic: &str,
        listener: &Arc<dyn MessageListener>,
    ) -> Result<(), ConnectionError> {
        let handle = ListenerHandle::new(listener.clone());
        let remaining_for_topic = {
            let mut subscriptions = self.subscriptions.write().await;
            subscriptions.retain(|s| !(s.topic == topic && s.listener == handle));
            subscriptions.iter().any(|s| s.topic == topic)
        };

        if !remaining_for_topic {
            if let Some(session) = self.current_session().await {
                session.unsubscribe(topic).await?;
                debug!(topic = %topic, "unsubscribed from broker");
            }
        }
        Ok(())
    }

    async fn current_session(&self) -> Option<Arc<dyn MqttSession>> {
        self.state.lock().await.as_ref().map(|open| open.session.clone())
    }

    fn session_options(&self, options: &ConnectionOptions) -> SessionOptions {
        SessionOptions {
            host: options.host.clone(),
            port: options.port,
            client_id: self
                .settings
                .client_id
                .clone()
                .unwrap_or_else(default_client_id),
            username: options.username.clone(),
            password: options.password.clone(),
            keep_alive: self.settings.keep_alive,
            retry_connect: self.settings.retry_connect,
            reconnect_delay: self.settings.reconnect_timeout,
        }
    }
}

fn default_client_id() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| format!("mqtt-queue-{}", Uuid::new_v4()))
}

/// Fans the session's incoming-message stream out to matching listeners.
///
/// A subscription with the exact flag only receives messages whose topic is
/// string-equal to its filter; wildcard subscriptions receive every delivered
/// message, as wildcard matching is delegated to the broker.
async fn dispatch(
    mut incoming: mpsc::Receiver<IncomingMessage>,
    subscriptions: Arc<RwLock<Vec<TopicSubscription>>>,
) {
    while let Some(message) = incoming.recv().await {
        // release the lock before invoking listeners, so a listener may
        // subscribe or unsubscribe on the same connection from on_message
        let matching: Vec<ListenerHandle> = {
            let subscriptions = subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| !s.exact || s.topic == message.topic)
                .map(|s| s.listener.clone())
                .collect()
        };
        for listener in matching {
            listener.on_message(message.clone()).await;
        }
    }
}
