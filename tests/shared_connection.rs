/********************************************************************************
 * Copyright (c) 2026 Contributors to the mqtt-queue project
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Exercises the public API with several logical queues sharing one
//! connection over the in-process loopback broker.

use std::sync::Arc;
use std::time::Duration;

use mqtt_queue::{
    ConnectionParams, ConnectionSettings, LocalSessionFactory, MessageEnvelope, MqttConnection,
    MqttConnectionResolver, MqttMessageQueue, QueueSettings,
};

fn loopback_connection() -> MqttConnection {
    let resolver = MqttConnectionResolver::default().with_connection(ConnectionParams {
        protocol: Some("mqtt".to_string()),
        host: Some("localhost".to_string()),
        port: Some(1883),
        ..Default::default()
    });
    MqttConnection::new(resolver)
        .with_settings(ConnectionSettings::default().with_client_id("integration-test"))
        .with_session_factory(Arc::new(LocalSessionFactory::default()))
}

#[tokio::test]
async fn two_queues_share_one_connection() {
    let connection = Arc::new(loopback_connection());
    connection.open().await.unwrap();

    let orders = MqttMessageQueue::with_shared_connection("orders", connection.clone())
        .with_settings(QueueSettings::default().with_serialize_envelope(true));
    let audit = MqttMessageQueue::with_shared_connection("audit", connection.clone())
        .with_settings(QueueSettings::default().with_serialize_envelope(true));
    orders.open().await.unwrap();
    audit.open().await.unwrap();

    // subscribe both before sending
    assert!(orders.peek().await.unwrap().is_none());
    assert!(audit.peek().await.unwrap().is_none());

    orders
        .send(MessageEnvelope::with_string_payload(
            Some("c1".to_string()),
            Some("OrderCreated".to_string()),
            "order 17",
        ))
        .await
        .unwrap();
    audit
        .send(MessageEnvelope::with_string_payload(
            Some("c2".to_string()),
            Some("AuditEvent".to_string()),
            "login",
        ))
        .await
        .unwrap();

    let order = orders
        .receive(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("orders queue should deliver its message");
    assert_eq!(order.message_type.as_deref(), Some("OrderCreated"));
    assert_eq!(order.payload_as_string(), "order 17");

    let event = audit
        .receive(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("audit queue should deliver its message");
    assert_eq!(event.message_type.as_deref(), Some("AuditEvent"));
    assert_eq!(event.correlation_id.as_deref(), Some("c2"));

    // messages do not leak between queues
    assert_eq!(orders.message_count().await.unwrap(), 0);
    assert_eq!(audit.message_count().await.unwrap(), 0);

    orders.close().await.unwrap();
    audit.close().await.unwrap();
    // queues on a shared connection leave it open for the owner
    assert!(connection.is_open().await);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn owned_connection_closes_with_queue() {
    let queue = MqttMessageQueue::new("solo", loopback_connection())
        .with_settings(QueueSettings::default().with_serialize_envelope(true));
    queue.open().await.unwrap();
    assert!(queue.is_open());

    queue
        .send(MessageEnvelope::with_string_payload(
            Some("123".to_string()),
            Some("Test".to_string()),
            "Test message",
        ))
        .await
        .unwrap();

    // the queue subscribed lazily after the send, so the first message is
    // lost to the broker; a second send is buffered
    assert!(queue.peek().await.unwrap().is_none());
    queue
        .send(MessageEnvelope::with_string_payload(
            Some("123".to_string()),
            Some("Test".to_string()),
            "Test message",
        ))
        .await
        .unwrap();

    let received = queue
        .receive(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("queue should deliver the buffered message");
    assert_eq!(received.message_type.as_deref(), Some("Test"));
    assert_eq!(received.payload_as_string(), "Test message");

    queue.close().await.unwrap();
    assert!(!queue.is_open());
    assert!(queue
        .receive(Duration::from_millis(10))
        .await
        .is_err());
}
