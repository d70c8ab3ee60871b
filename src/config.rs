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
Resolution and validation of broker connection parameters.

Connection and credential parameters may be configured directly or obtained
from pluggable [`DiscoveryService`] and [`CredentialStore`] lookups. The
resolver validates the parameters and composes them into a normalized
[`ConnectionOptions`] bundle.
*/

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-util"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uriparse::URIReference;

use crate::error::ConfigError;

/// The default MQTT port, used when a configured URI does not carry one.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Broker endpoint parameters as supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Connection protocol, e.g. `mqtt`.
    pub protocol: Option<String>,
    /// Broker host name or address.
    pub host: Option<String>,
    /// Broker port.
    pub port: Option<u16>,
    /// Full broker URI; supersedes protocol, host and port when present.
    pub uri: Option<String>,
    /// Key for looking up the connection in a discovery service.
    pub discovery_key: Option<String>,
}

impl ConnectionParams {
    /// Checks whether no endpoint information is present at all.
    pub fn is_empty(&self) -> bool {
        self.protocol.is_none()
            && self.host.is_none()
            && self.port.is_none()
            && self.uri.is_none()
    }

    /// Fills fields that are unset on `self` from the given parameters.
    fn fill_missing_from(&mut self, other: ConnectionParams) {
        self.protocol = self.protocol.take().or(other.protocol);
        self.host = self.host.take().or(other.host);
        self.port = self.port.take().or(other.port);
        self.uri = self.uri.take().or(other.uri);
    }
}

/// Broker credential parameters as supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialParams {
    /// User name for broker authentication.
    pub username: Option<String>,
    /// Password for broker authentication.
    pub password: Option<String>,
    /// Key for looking up the credential in a credential store.
    pub store_key: Option<String>,
}

impl CredentialParams {
    fn fill_missing_from(&mut self, other: CredentialParams) {
        self.username = self.username.take().or(other.username);
        self.password = self.password.take().or(other.password);
    }
}

/// The normalized endpoint and credential bundle used to open a session.
///
/// Built once per [`open`](crate::MqttConnection::open) and immutable after
/// composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Full broker URI.
    pub uri: String,
    /// Connection protocol.
    pub protocol: String,
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// User name for broker authentication.
    pub username: Option<String>,
    /// Password for broker authentication.
    pub password: Option<String>,
}

/// A lookup for connection parameters registered under a discovery key.
#[cfg_attr(any(test, feature = "test-util"), automock)]
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    /// Looks up connection parameters by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails; an unknown key yields
    /// `Ok(None)`.
    async fn lookup_connection(&self, key: &str) -> Result<Option<ConnectionParams>, ConfigError>;
}

/// A lookup for credential parameters registered under a store key.
#[cfg_attr(any(test, feature = "test-util"), automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Looks up credential parameters by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails; an unknown key yields
    /// `Ok(None)`.
    async fn lookup_credential(&self, key: &str) -> Result<Option<CredentialParams>, ConfigError>;
}

/// Resolves and validates broker connection parameters into a normalized
/// [`ConnectionOptions`] bundle.
///
/// # Examples
///
/// ```rust
/// use mqtt_queue::{ConnectionParams, MqttConnectionResolver};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let resolver = MqttConnectionResolver::default().with_connection(ConnectionParams {
///     protocol: Some("mqtt".to_string()),
///     host: Some("localhost".to_string()),
///     port: Some(1883),
///     ..Default::default()
/// });
/// let options = resolver.resolve().await.unwrap();
/// assert_eq!(options.uri, "mqtt://localhost:1883");
/// # }
/// ```
#[derive(Default)]
pub struct MqttConnectionResolver {
    connection: Option<ConnectionParams>,
    credential: Option<CredentialParams>,
    discovery: Option<Arc<dyn DiscoveryService>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
}

impl MqttConnectionResolver {
    /// Sets the directly configured connection parameters.
    pub fn with_connection(mut self, connection: ConnectionParams) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Sets the directly configured credential parameters.
    pub fn with_credential(mut self, credential: CredentialParams) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets the discovery service used to look up connection parameters by
    /// their discovery key.
    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryService>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Sets the credential store used to look up credential parameters by
    /// their store key.
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Obtains connection and credential parameters from the configured
    /// sources, then validates and composes them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConnection`] if no connection parameters
    /// exist at all, or `NoProtocol`/`NoHost`/`NoPort` if a required field is
    /// missing and no full URI was supplied.
    pub async fn resolve(&self) -> Result<ConnectionOptions, ConfigError> {
        let mut connection = self.connection.clone();

        let discovery_key = connection.as_ref().and_then(|c| c.discovery_key.clone());
        if let (Some(service), Some(key)) = (self.discovery.as_ref(), discovery_key) {
            if let Some(discovered) = service.lookup_connection(&key).await? {
                debug!(discovery_key = %key, "resolved connection from discovery");
                let mut merged = connection.take().unwrap_or_default();
                merged.fill_missing_from(discovered);
                connection = Some(merged);
            }
        }

        let mut credential = self.credential.clone();
        let store_key = credential.as_ref().and_then(|c| c.store_key.clone());
        if let (Some(store), Some(key)) = (self.credential_store.as_ref(), store_key) {
            if let Some(looked_up) = store.lookup_credential(&key).await? {
                debug!(store_key = %key, "resolved credential from store");
                let mut merged = credential.take().unwrap_or_default();
                merged.fill_missing_from(looked_up);
                credential = Some(merged);
            }
        }

        let connection = connection.ok_or(ConfigError::NoConnection)?;
        Self::compose(&connection, credential.as_ref())
    }

    /// Validates and composes caller-supplied parameter bundles into
    /// [`ConnectionOptions`].
    ///
    /// Composes `uri = "{protocol}://{host}:{port}"` when no full URI is
    /// given. Credential fields are merged into the result without
    /// discarding explicit connection fields.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a required field is missing and no full
    /// URI was supplied, or if a supplied URI cannot be parsed.
    pub fn compose(
        connection: &ConnectionParams,
        credential: Option<&CredentialParams>,
    ) -> Result<ConnectionOptions, ConfigError> {
        if connection.is_empty() {
            return Err(ConfigError::NoConnection);
        }

        let (uri, protocol, host, port) = match connection.uri.as_deref().filter(|u| !u.is_empty())
        {
            Some(uri) => {
                let parsed = URIReference::try_from(uri)
                    .map_err(|e| ConfigError::MalformedUri(format!("{uri}: {e}")))?;
                let protocol = parsed
                    .scheme()
                    .map(|s| s.as_str().to_string())
                    .ok_or_else(|| ConfigError::MalformedUri(format!("{uri}: missing scheme")))?;
                let host = parsed
                    .host()
                    .map(|h| h.to_string())
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| ConfigError::MalformedUri(format!("{uri}: missing host")))?;
                let port = parsed.port().unwrap_or(DEFAULT_MQTT_PORT);
                (uri.to_string(), protocol, host, port)
            }
            None => {
                let protocol = connection
                    .protocol
                    .clone()
                    .filter(|p| !p.is_empty())
                    .ok_or(ConfigError::NoProtocol)?;
                let host = connection
                    .host
                    .clone()
                    .filter(|h| !h.is_empty())
                    .ok_or(ConfigError::NoHost)?;
                let port = connection.port.filter(|p| *p > 0).ok_or(ConfigError::NoPort)?;
                let uri = format!("{protocol}://{host}:{port}");
                (uri, protocol, host, port)
            }
        };

        Ok(ConnectionOptions {
            uri,
            protocol,
            host,
            port,
            username: credential.and_then(|c| c.username.clone()),
            password: credential.and_then(|c| c.password.clone()),
        })
    }
}
