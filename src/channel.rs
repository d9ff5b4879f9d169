// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels, and the
//! per-channel prefetch limit used for fair dispatch between workers.

use crate::{config::RabbitMQConfigs, errors::AmqpError};
use lapin::{
    options::BasicQosOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// This function establishes a connection to RabbitMQ using the configuration
/// provided in `cfg`, then creates a channel on that connection. When a
/// prefetch limit is configured it is applied to the new channel.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), rabbitmq_patterns::errors::AmqpError> {
/// use rabbitmq_patterns::{channel::new_amqp_channel, config::RabbitMQConfigs};
///
/// let cfg = RabbitMQConfigs::from_env()?;
/// let (conn, channel) = new_amqp_channel(&cfg).await?;
/// # Ok(())
/// # }
/// ```
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), host = %cfg.host, "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }?;

    if let Some(prefetch) = cfg.prefetch {
        configure_qos(&channel, prefetch).await?;
    }

    Ok((Arc::new(conn), Arc::new(channel)))
}

/// Limits the number of unacknowledged deliveries per consumer on the channel.
///
/// A prefetch of 1 makes the broker hand a new message to a worker only after
/// it acknowledged the previous one, so slow workers are not overloaded.
pub async fn configure_qos(channel: &Channel, prefetch: u16) -> Result<(), AmqpError> {
    match channel
        .basic_qos(prefetch, BasicQosOptions { global: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), prefetch, "failure to configure qos");
            Err(AmqpError::QoSDeclarationError(err.to_string()))
        }
        _ => {
            debug!(prefetch, "qos configured");
            Ok(())
        }
    }
}
