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
A [`SessionFactory`] backed by the `rumqttc` broker client.

The factory drives the client's event loop on a dedicated task which pumps
incoming publishes into the session's message stream and re-establishes the
network connection after failures, as configured.
*/

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::session::{IncomingMessage, MqttSession, QoS, SessionFactory, SessionHandle, SessionOptions};

const INCOMING_CHANNEL_CAPACITY: usize = 1024;
const REQUEST_CHANNEL_CAPACITY: usize = 64;

fn to_client_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_client_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// A [`SessionFactory`] establishing real broker sessions via `rumqttc`.
#[derive(Debug, Default)]
pub struct RumqttSessionFactory {}

#[async_trait]
impl SessionFactory for RumqttSessionFactory {
    async fn connect(&self, options: &SessionOptions) -> Result<SessionHandle, ConnectionError> {
        let mut mqtt_options =
            MqttOptions::new(options.client_id.as_str(), options.host.as_str(), options.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        // keep broker-side session state across reconnects
        mqtt_options.set_clean_session(false);
        if let Some(username) = &options.username {
            mqtt_options.set_credentials(
                username.clone(),
                options.password.clone().unwrap_or_default(),
            );
        }

        let (client, mut event_loop) =
            AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        // drive the event loop until the broker acknowledges the connection
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(ConnectionError::connect_failed(format!(
                        "broker refused connection: {:?}",
                        ack.code
                    )));
                }
                Ok(_) => {}
                Err(err) => return Err(ConnectionError::connect_failed(err)),
            }
        }
        debug!(
            host = %options.host,
            port = options.port,
            client_id = %options.client_id,
            "MQTT session established"
        );

        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let subscriptions = Arc::new(SubscriptionLog::default());
        let pump = tokio::spawn(pump_events(
            event_loop,
            client.clone(),
            subscriptions.clone(),
            tx,
            options.retry_connect,
            options.reconnect_delay,
        ));

        Ok(SessionHandle {
            session: Arc::new(RumqttSession {
                client,
                subscriptions,
                pump: Mutex::new(Some(pump)),
            }),
            incoming: rx,
        })
    }
}

/// The topic filters subscribed on a live session.
///
/// The pump re-issues them when the event loop re-establishes a connection
/// the broker holds no session state for.
#[derive(Default)]
struct SubscriptionLog {
    filters: Mutex<Vec<(String, QoS)>>,
}

impl SubscriptionLog {
    fn record(&self, topic: &str, qos: QoS) {
        if let Ok(mut filters) = self.filters.lock() {
            if let Some(existing) = filters.iter_mut().find(|(t, _)| t == topic) {
                existing.1 = qos;
            } else {
                filters.push((topic.to_string(), qos));
            }
        }
    }

    fn remove(&self, topic: &str) {
        if let Ok(mut filters) = self.filters.lock() {
            filters.retain(|(t, _)| t != topic);
        }
    }

    fn snapshot(&self) -> Vec<(String, QoS)> {
        self.filters.lock().map(|f| f.clone()).unwrap_or_default()
    }
}

/// Drives the client event loop, forwarding publishes to the session's
/// message stream and restoring subscriptions after a reconnect.
async fn pump_events(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<SubscriptionLog>,
    tx: mpsc::Sender<IncomingMessage>,
    retry_connect: bool,
    reconnect_delay: std::time::Duration,
) {
    loop {
        match event_loop.poll().await {
            // only seen after a reconnect; the initial acknowledgment is
            // consumed while establishing the session
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.session_present {
                    continue;
                }
                let filters = subscriptions.snapshot();
                debug!(count = filters.len(), "restoring subscriptions after reconnect");
                for (topic, qos) in filters {
                    if let Err(err) = client.subscribe(topic, to_client_qos(qos)).await {
                        warn!("failed to restore subscription after reconnect: {err}");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = IncomingMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos: from_client_qos(publish.qos),
                    retain: publish.retain,
                    dup: publish.dup,
                };
                // the receiver is dropped when the session is closed
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => {
                if !retry_connect {
                    warn!("MQTT session lost, giving up: {err}");
                    break;
                }
                debug!("MQTT session lost, reconnecting: {err}");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

struct RumqttSession {
    client: AsyncClient,
    subscriptions: Arc<SubscriptionLog>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl MqttSession for RumqttSession {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        self.client
            .publish(topic, to_client_qos(qos), retain, payload)
            .await
            .map_err(|e| ConnectionError::Broker(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ConnectionError> {
        self.client
            .subscribe(topic, to_client_qos(qos))
            .await
            .map_err(|e| ConnectionError::Broker(e.to_string()))?;
        self.subscriptions.record(topic, qos);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| ConnectionError::Broker(e.to_string()))?;
        self.subscriptions.remove(topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| ConnectionError::Broker(e.to_string()));
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        result
    }
}
