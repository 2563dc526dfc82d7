// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Channel Management
//!
//! The [`ConnectionManager`] owns the single broker connection shared by every
//! binding. Channels are cheap handles multiplexed over it; a [`ManagedChannel`]
//! remembers its direction and settings so it can be re-created on a new connection
//! without its owner noticing.
//!
//! Reconnection happens under the manager's lock, so every channel observes the same
//! connection generation. Endpoints are tried in order starting after the one that
//! failed, with exponential backoff between attempts; once the retry budget is spent
//! callers receive `ConnectionLost` and the status moves to `Failed`.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    config::RetryPolicy,
    errors::BinderError,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::{
    sync::{watch, Mutex},
    time,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Observable state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection attempted yet
    Idle,
    Connected,
    /// Connection lost, attempts in progress
    Reconnecting,
    /// Retry budget exhausted
    Failed,
    Closed,
}

/// Direction of the traffic a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Per-channel settings applied every time the channel is (re)created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Unacknowledged deliveries allowed in flight, inbound only
    pub prefetch: u16,
    /// Publisher confirms, outbound only
    pub confirms: bool,
}

impl ChannelSettings {
    pub fn outbound() -> Self {
        ChannelSettings {
            prefetch: 0,
            confirms: true,
        }
    }

    pub fn inbound(prefetch: u16) -> Self {
        ChannelSettings {
            prefetch,
            confirms: false,
        }
    }
}

struct ConnectionState {
    connection: Option<Arc<dyn BrokerConnection>>,
    endpoint: Option<usize>,
}

/// Owns the shared broker connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    endpoints: Vec<String>,
    connection_name: String,
    retry: RetryPolicy,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
    closed: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionManager {
    /// # Parameters
    /// * `connector` - Opens physical connections
    /// * `endpoints` - Ordered broker addresses
    /// * `connection_name` - Name reported to the broker
    /// * `retry` - Reconnection budget and backoff
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoints: Vec<String>,
        connection_name: &str,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Idle);

        Arc::new(ConnectionManager {
            connector,
            endpoints,
            connection_name: connection_name.to_owned(),
            retry,
            state: Mutex::new(ConnectionState {
                connection: None,
                endpoint: None,
            }),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            status,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Generation of the current connection; bumped on every (re)connection.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Address of the endpoint currently connected, if any.
    pub async fn current_endpoint(&self) -> Option<String> {
        let state = self.state.lock().await;
        match (&state.connection, state.endpoint) {
            (Some(conn), Some(idx)) if conn.is_open() => self.endpoints.get(idx).cloned(),
            _ => None,
        }
    }

    /// Returns the live connection and its generation, connecting first if needed.
    pub async fn connection(&self) -> Result<(Arc<dyn BrokerConnection>, u64), BinderError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BinderError::BinderShuttingDown);
        }

        let mut state = self.state.lock().await;

        if let Some(conn) = &state.connection {
            if conn.is_open() {
                return Ok((conn.clone(), self.generation()));
            }

            warn!(connection = self.connection_name.as_str(), "broker connection lost");
            state.connection = None;
            self.status.send_replace(ConnectionStatus::Reconnecting);
        }

        self.establish(&mut state).await
    }

    /// Reports a failure observed on `generation`. The connection is dropped only when
    /// it is no longer open, so a failed channel leaves the other bindings alone.
    pub async fn report_failure(&self, generation: u64) {
        let mut state = self.state.lock().await;

        if generation != self.generation() {
            return;
        }

        if state.connection.as_ref().is_some_and(|conn| conn.is_open()) {
            debug!(generation = generation, "connection still open, keeping it");
            return;
        }

        if let Some(conn) = state.connection.take() {
            debug!(generation = generation, "dropping failed connection");
            if let Err(err) = conn.close().await {
                debug!(error = err.to_string(), "failed connection already closed");
            }
            self.status.send_replace(ConnectionStatus::Reconnecting);
        }
    }

    /// Opens a channel handle; the underlying channel is created immediately.
    pub async fn open_channel(
        self: &Arc<Self>,
        direction: Direction,
        settings: ChannelSettings,
    ) -> Result<ManagedChannel, BinderError> {
        let channel = ManagedChannel {
            id: Uuid::new_v4(),
            manager: self.clone(),
            direction,
            settings,
            current: Mutex::new(None),
        };

        channel.acquire().await?;
        Ok(channel)
    }

    pub async fn close_channel(&self, channel: &ManagedChannel) -> Result<(), BinderError> {
        channel.close().await
    }

    /// Closes the shared connection; later calls fail with `BinderShuttingDown`.
    pub async fn shutdown(&self) -> Result<(), BinderError> {
        self.closed.store(true, Ordering::SeqCst);

        let mut state = self.state.lock().await;
        self.status.send_replace(ConnectionStatus::Closed);

        if let Some(conn) = state.connection.take() {
            info!(connection = self.connection_name.as_str(), "closing broker connection");
            conn.close().await?;
        }

        Ok(())
    }

    async fn establish(
        &self,
        state: &mut ConnectionState,
    ) -> Result<(Arc<dyn BrokerConnection>, u64), BinderError> {
        if self.endpoints.is_empty() {
            return Err(BinderError::InvalidConfig("no broker endpoint configured".to_owned()));
        }

        let start = state.endpoint.map(|idx| idx + 1).unwrap_or_default();
        let mut last_err = String::new();

        for attempt in 1..=self.retry.max_attempts {
            let idx = (start + attempt as usize - 1) % self.endpoints.len();
            let address = &self.endpoints[idx];

            debug!(address = address.as_str(), attempt = attempt, "connecting to broker");

            match self.connector.connect(address, &self.connection_name).await {
                Ok(conn) => {
                    state.connection = Some(conn.clone());
                    state.endpoint = Some(idx);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.status.send_replace(ConnectionStatus::Connected);

                    info!(
                        address = address.as_str(),
                        generation = generation,
                        "connected to broker"
                    );
                    return Ok((conn, generation));
                }
                Err(err) => {
                    last_err = err.to_string();
                    if attempt < self.retry.max_attempts {
                        let delay = self.retry.backoff(attempt);
                        warn!(
                            address = address.as_str(),
                            error = last_err.as_str(),
                            delay_ms = delay.as_millis() as u64,
                            "connection attempt failed"
                        );
                        self.status.send_replace(ConnectionStatus::Reconnecting);
                        time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            attempts = self.retry.max_attempts,
            error = last_err.as_str(),
            "unable to reach any broker endpoint"
        );
        self.status.send_replace(ConnectionStatus::Failed);

        Err(BinderError::ConnectionLost(last_err))
    }
}

/// A channel handle that survives reconnections.
pub struct ManagedChannel {
    id: Uuid,
    manager: Arc<ConnectionManager>,
    direction: Direction,
    settings: ChannelSettings,
    current: Mutex<Option<(Arc<dyn BrokerChannel>, u64)>>,
}

impl ManagedChannel {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn settings(&self) -> ChannelSettings {
        self.settings
    }

    /// Returns a live channel, re-creating it on the current connection if needed.
    pub async fn acquire(&self) -> Result<Arc<dyn BrokerChannel>, BinderError> {
        let mut current = self.current.lock().await;

        if let Some((channel, generation)) = current.as_ref() {
            if channel.is_open() && *generation == self.manager.generation() {
                return Ok(channel.clone());
            }
        }

        let (conn, generation) = self.manager.connection().await?;

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                if err.is_connection_loss() {
                    self.manager.report_failure(generation).await;
                }
                return Err(err);
            }
        };

        match self.direction {
            Direction::Outbound if self.settings.confirms => channel.enable_confirms().await?,
            Direction::Inbound => channel.set_prefetch(self.settings.prefetch).await?,
            _ => {}
        }

        debug!(
            channel = self.id.to_string(),
            generation = generation,
            "channel established"
        );
        *current = Some((channel.clone(), generation));

        Ok(channel)
    }

    /// Drops the current channel after it failed; the next `acquire` opens a new one.
    pub async fn invalidate(&self) {
        let stale = self.current.lock().await.take();

        if let Some((channel, generation)) = stale {
            if let Err(err) = channel.close().await {
                debug!(error = err.to_string(), "stale channel already closed");
            }
            self.manager.report_failure(generation).await;
        }
    }

    async fn close(&self) -> Result<(), BinderError> {
        let current = self.current.lock().await.take();

        match current {
            Some((channel, _)) => channel.close().await,
            None => Ok(()),
        }
    }
}
