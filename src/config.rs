// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Connection settings for the RabbitMQ server. Values can be deserialized from
//! any serde source or read from `RABBITMQ_*` environment variables; missing
//! values fall back to a local broker with the default guest account.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::time::Duration;

/// Environment variables read by [`RabbitMQConfigs::from_env`].
pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_USER: &str = "RABBITMQ_USER";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_PREFETCH: &str = "RABBITMQ_PREFETCH";
pub const ENV_CONFIRM_TIMEOUT_MS: &str = "RABBITMQ_CONFIRM_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub app_name: String,
    /// Unacknowledged deliveries per consumer; `None` leaves the broker default.
    pub prefetch: Option<u16>,
    pub confirm_timeout_ms: u64,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            app_name: "rabbitmq-patterns".to_owned(),
            prefetch: None,
            confirm_timeout_ms: 5_000,
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<RabbitMQConfigs, AmqpError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from a key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<RabbitMQConfigs, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();

        if let Some(host) = lookup(ENV_HOST) {
            cfg.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            cfg.port = parse(ENV_PORT, &port)?;
        }
        if let Some(user) = lookup(ENV_USER) {
            cfg.user = user;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            cfg.password = password;
        }
        if let Some(vhost) = lookup(ENV_VHOST) {
            cfg.vhost = vhost;
        }
        if let Some(name) = lookup(ENV_APP_NAME) {
            cfg.app_name = name;
        }
        if let Some(prefetch) = lookup(ENV_PREFETCH) {
            cfg.prefetch = Some(parse(ENV_PREFETCH, &prefetch)?);
        }
        if let Some(timeout) = lookup(ENV_CONFIRM_TIMEOUT_MS) {
            cfg.confirm_timeout_ms = parse(ENV_CONFIRM_TIMEOUT_MS, &timeout)?;
        }

        Ok(cfg)
    }

    /// The AMQP URI of the configured server.
    pub fn uri(&self) -> String {
        // the default vhost "/" must be escaped in the URI path
        let vhost = if self.vhost == "/" { "%2f" } else { &self.vhost };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }

    /// How long a publisher waits for outstanding confirmations.
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

fn parse<V: std::str::FromStr>(key: &str, value: &str) -> Result<V, AmqpError> {
    value
        .trim()
        .parse()
        .map_err(|_| AmqpError::ConfigError(format!("{}={}", key, value)))
}
