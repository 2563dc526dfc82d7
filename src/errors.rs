// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Binder
//!
//! This module provides the error taxonomy shared by every layer of the binder:
//! provisioning, connection management, the send/receive paths and the payload
//! pipeline. Binding-level failures (`ProvisioningFailed`, `TopologyConflict`,
//! `ConnectionLost`) are separated from per-message failures
//! (`PayloadDecodeError`, `PayloadEncodeError`, `PublishRejected`) so callers can
//! decide whether a binding is still usable.

use thiserror::Error;

/// Represents errors that can occur while binding application channels to RabbitMQ.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinderError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// The binder configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The binding request is malformed or used with the wrong operation
    #[error("invalid binding spec: {0}")]
    InvalidBindingSpec(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect to `{0}`")]
    ConnectionError(String),

    /// The shared connection was lost and could not be re-established
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// An existing broker object has attributes incompatible with the requested ones
    #[error("topology conflict on `{0}`")]
    TopologyConflict(String),

    /// Declarations kept failing after the retry budget was spent
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// A consumer handler failed to process a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker negatively confirmed a publish after every retry
    #[error("publish rejected by the broker after {0} attempts")]
    PublishRejected(u32),

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDLQError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error serializing an application payload
    #[error("failure to encode payload: {0}")]
    PayloadEncodeError(String),

    /// Error deserializing or decompressing an inbound payload
    #[error("failure to decode payload: {0}")]
    PayloadDecodeError(String),

    /// The binding is not in the `Active` state
    #[error("binding `{0}` is not active")]
    BindingNotActive(String),

    /// The binder is shutting down and refuses new work
    #[error("binder is shutting down")]
    BinderShuttingDown,

    /// An operation exceeded its time budget
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
}

impl BinderError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BinderError::ConnectionError(_)
                | BinderError::ConnectionLost(_)
                | BinderError::ChannelError(_)
                | BinderError::Timeout(_)
        )
    }

    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BinderError::ConnectionError(_) | BinderError::ConnectionLost(_)
        )
    }
}
