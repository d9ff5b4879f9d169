// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Patterns
//!
//! This module provides the error type shared by the broker glue (connection,
//! channel, declarations, publishing) and by the client-side algorithms
//! (topic pattern parsing and publisher-confirm reconciliation).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Negative confirmations are not errors: they are reported as
/// [`Outcome::Nack`](crate::confirms::Outcome) resolutions and the caller
/// decides the retry or dead-letter policy.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error reading the connection configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error putting a channel into confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error referencing an exchange that is not part of the topology
    #[error("unknown exchange `{0}`")]
    UnknownExchangeError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A binding key that cannot be used as a topic pattern
    #[error("malformed pattern `{pattern}`: {reason}")]
    MalformedPattern { pattern: String, reason: String },

    /// A confirmation referencing a sequence number that was never published
    #[error("confirmation for unknown sequence number `{0}`")]
    UnknownSequenceNumber(u64),

    /// Outstanding confirmations did not drain before the deadline
    #[error("{outstanding} messages still unconfirmed after {timeout_ms}ms")]
    DrainTimeout { outstanding: usize, timeout_ms: u128 },
}
