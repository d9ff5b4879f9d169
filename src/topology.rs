// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for defining and creating RabbitMQ topology components.
//! The topology includes exchanges, queues, and the bindings between them.
//!
//! The main components are:
//! - `TopologyDefinition`: the declared exchanges, queues and bindings, which can
//!   also be turned into a local [`RoutingTable`] per exchange
//! - `Topology` trait: Interface for topology installation
//! - `AmqpTopology`: Implementation of the Topology trait for RabbitMQ

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    routing::RoutingTable,
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// The exchanges, queues and bindings of an application.
#[derive(Debug, Clone, Default)]
pub struct TopologyDefinition {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl TopologyDefinition {
    /// Creates an empty topology.
    pub fn new() -> TopologyDefinition {
        TopologyDefinition::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Builds the local routing table of `exchange` from the declared bindings.
    ///
    /// Destinations are queue names.
    ///
    /// # Errors
    /// `UnknownExchangeError` when the exchange is not declared, or
    /// `MalformedPattern` when a binding key is invalid.
    pub fn routing_table(&self, exchange: &str) -> Result<RoutingTable<String>, AmqpError> {
        let Some(def) = self.exchanges.iter().find(|e| e.name == exchange) else {
            return Err(AmqpError::UnknownExchangeError(exchange.to_owned()));
        };

        let mut table = RoutingTable::new(def.kind);
        for binding in self
            .queues_binding
            .iter()
            .filter(|b| b.exchange_name == exchange)
        {
            table.bind(&binding.routing_key, binding.queue_name.clone())?;
        }

        Ok(table)
    }
}

/// Trait defining the interface for topology installation.
#[async_trait]
pub trait Topology {
    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<Channel>,
    def: TopologyDefinition,
}

impl AmqpTopology {
    /// Creates a new AmqpTopology instance.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server
    /// * `def` - The exchanges, queues and bindings to install
    pub fn new(channel: Arc<Channel>, def: TopologyDefinition) -> AmqpTopology {
        AmqpTopology { channel, def }
    }

    /// Returns the topology this instance installs.
    pub fn definition(&self) -> &TopologyDefinition {
        &self.def
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates all exchanges
    /// 2. Creates all queues
    /// 3. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    /// Creates all exchanges defined in the topology.
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.def.exchanges {
            debug!("creating exchange: {}", exch.name);

            match self
                .channel
                .exchange_declare(
                    &exch.name,
                    exch.kind.into(),
                    ExchangeDeclareOptions {
                        passive: exch.passive,
                        durable: exch.durable,
                        auto_delete: exch.delete,
                        internal: exch.internal,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = %exch.name,
                        "error to declare the exchange"
                    );
                    Err(AmqpError::DeclareExchangeError(exch.name.clone()))
                }
                _ => Ok(()),
            }?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    /// Creates all queues defined in the topology.
    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.def.queues {
            debug!("creating queue: {}", def.name);

            match self
                .channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: def.passive,
                        durable: def.durable,
                        exclusive: def.exclusive,
                        auto_delete: def.delete,
                        nowait: false,
                    },
                    FieldTable::from(queue_arguments(def)),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                _ => {
                    debug!("queue: {} was created", def.name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    /// Sets up queue-to-exchange bindings.
    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.def.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}

fn queue_arguments(def: &QueueDefinition) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    args
}
