// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirming Publisher
//!
//! This module publishes messages on a channel in confirm mode and keeps track
//! of which ones the broker has not confirmed yet.
//!
//! Publishing and confirmation run on different paths: `ConfirmPublisher::publish`
//! records the message in a [`ConfirmLedger`] and hands it to a [`ConfirmChannel`],
//! while the channel reports broker acks and nacks as [`ConfirmEvent`]s that a
//! background reconciler applies to the ledger.
//!
//! Three strategies are available, trading throughput for error locality:
//! waiting after every message, after every batch, or once after all messages.

use crate::{
    confirms::{ConfirmEvent, ConfirmLedger, Outcome, Outstanding},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
#[cfg(test)]
use mockall::automock;
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishMessage {
    /// Exchange name; empty for the default exchange
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
}

impl PublishMessage {
    /// Creates a message for the exchange `to` with the given body.
    ///
    /// # Parameters
    /// * `to` - The exchange name, empty for the default exchange
    /// * `data` - The message body
    pub fn new(to: &str, data: &[u8]) -> PublishMessage {
        PublishMessage {
            to: to.to_owned(),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    /// Serializes `payload` as the JSON body of a new message.
    pub fn json<T: Serialize>(to: &str, payload: &T) -> Result<PublishMessage, AmqpError> {
        match serde_json::to_vec(payload) {
            Ok(data) => Ok(PublishMessage {
                to: to.to_owned(),
                data,
                ..Default::default()
            }),
            Err(err) => {
                error!(error = err.to_string(), "error serializing payload");
                Err(AmqpError::SerializePayloadError)
            }
        }
    }

    /// Sets the routing key.
    pub fn key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    /// Sets the message type property.
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }
}

/// A channel that publishes messages whose confirmations are reported later.
///
/// Implementations must eventually report one [`ConfirmEvent`] covering every
/// sequence number they accepted.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfirmChannel: Send + Sync {
    /// Publishes `msg`, which the ledger recorded under `sequence`.
    ///
    /// # Returns
    /// Ok(()) once the channel accepted the message or AmqpError on failure
    async fn publish(&self, sequence: u64, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// lapin channel in confirm mode.
///
/// lapin resolves one `PublisherConfirm` per message, so every confirmation
/// is reported as a single (non-cumulative) event.
pub struct LapinConfirmChannel {
    channel: Arc<Channel>,
    events: UnboundedSender<ConfirmEvent>,
}

impl LapinConfirmChannel {
    /// Puts `channel` in confirm mode.
    ///
    /// # Returns
    /// The confirm channel and the receiver of its confirmation events
    pub async fn new(
        channel: Arc<Channel>,
    ) -> Result<(LapinConfirmChannel, UnboundedReceiver<ConfirmEvent>), AmqpError> {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ConfirmSelectError);
        }

        let (events, receiver) = mpsc::unbounded_channel();
        Ok((LapinConfirmChannel { channel, events }, receiver))
    }
}

#[async_trait]
impl ConfirmChannel for LapinConfirmChannel {
    async fn publish(&self, sequence: u64, msg: &PublishMessage) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(&Context::current(), &mut headers);

        let confirm = match self
            .channel
            .basic_publish(
                &msg.to,
                &msg.key.clone().unwrap_or_default(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                BasicProperties::default()
                    .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                    .with_type(ShortString::from(msg.msg_type.clone().unwrap_or_default()))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), sequence, "error publishing message");
                return Err(AmqpError::PublishingError);
            }
            Ok(confirm) => confirm,
        };

        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = match confirm.await {
                Ok(Confirmation::Ack(_)) => Outcome::Ack,
                Ok(Confirmation::Nack(_)) => Outcome::Nack,
                Ok(Confirmation::NotRequested) => {
                    error!(sequence, "channel is not in confirm mode");
                    Outcome::Nack
                }
                Err(err) => {
                    error!(error = err.to_string(), sequence, "error waiting for confirmation");
                    Outcome::Nack
                }
            };

            let event = ConfirmEvent {
                sequence,
                multiple: false,
                outcome,
            };
            if events.send(event).is_err() {
                debug!(sequence, "confirmation received after publisher was dropped");
            }
        });

        Ok(())
    }
}

/// How often a batch publish waits for confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStrategy {
    /// Wait after each message
    Individually,
    /// Wait after every `n` messages and after the last one
    Batch(usize),
    /// Publish everything, then wait once
    Asynchronously,
}

/// Result of a [`ConfirmPublisher::publish_all`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmReport {
    /// Number of messages handed to the channel
    pub published: usize,
    /// Messages the broker refused, in the order their nacks arrived
    pub nacked: Vec<Outstanding<PublishMessage>>,
}

impl ConfirmReport {
    /// Returns true when the broker refused none of the published messages.
    pub fn all_confirmed(&self) -> bool {
        self.nacked.is_empty()
    }
}

type Nacked = Arc<Mutex<Vec<Outstanding<PublishMessage>>>>;

/// First reconciliation fault, raised so that waiters wake up immediately.
#[derive(Debug)]
struct Fault {
    error: Mutex<Option<AmqpError>>,
    raised: watch::Sender<bool>,
}

impl Fault {
    fn new() -> Fault {
        let (raised, _) = watch::channel(false);
        Fault {
            error: Mutex::new(None),
            raised,
        }
    }

    fn raise(&self, err: AmqpError) {
        let mut error = lock(&self.error);
        error.get_or_insert(err);
        self.raised.send_replace(true);
    }

    fn take(&self) -> Option<AmqpError> {
        let mut error = lock(&self.error);
        self.raised.send_replace(false);
        error.take()
    }
}

/// Publishes messages and reconciles their confirmations.
pub struct ConfirmPublisher<C> {
    channel: C,
    ledger: Arc<ConfirmLedger<PublishMessage>>,
    nacked: Nacked,
    fault: Arc<Fault>,
    reconciler: JoinHandle<()>,
}

impl<C: ConfirmChannel> ConfirmPublisher<C> {
    /// Creates a publisher over `channel`, applying the confirmations received
    /// on `events` in a background task.
    ///
    /// # Parameters
    /// * `channel` - A channel in confirm mode
    /// * `events` - The confirmations reported by that channel
    pub fn new(channel: C, events: UnboundedReceiver<ConfirmEvent>) -> ConfirmPublisher<C> {
        let ledger = Arc::new(ConfirmLedger::new());
        let nacked = Nacked::default();
        let fault = Arc::new(Fault::new());

        let reconciler = tokio::spawn(reconcile(
            ledger.clone(),
            nacked.clone(),
            fault.clone(),
            events,
        ));

        ConfirmPublisher {
            channel,
            ledger,
            nacked,
            fault,
            reconciler,
        }
    }

    /// Returns the ledger of messages still waiting for a confirmation.
    pub fn ledger(&self) -> &ConfirmLedger<PublishMessage> {
        &self.ledger
    }

    /// Publishes a message and returns its sequence number.
    ///
    /// If the channel refuses the message it is removed from the ledger again
    /// and the error is returned.
    pub async fn publish(&self, msg: PublishMessage) -> Result<u64, AmqpError> {
        let sequence = self.ledger.record_publish(msg.clone());

        if let Err(err) = self.channel.publish(sequence, &msg).await {
            self.ledger
                .apply_confirmation(sequence, false, Outcome::Nack)?;
            return Err(err);
        }

        debug!(sequence, to = %msg.to, "message published");
        Ok(sequence)
    }

    /// Waits until every published message is confirmed.
    ///
    /// # Returns
    /// The messages nacked since the previous wait
    ///
    /// # Errors
    /// A reconciliation fault (such as `UnknownSequenceNumber`) as soon as it
    /// happens, otherwise `DrainTimeout` when the deadline passes.
    pub async fn wait_for_confirms(
        &self,
        timeout: Duration,
    ) -> Result<Vec<Outstanding<PublishMessage>>, AmqpError> {
        let mut raised = self.fault.raised.subscribe();

        let drained = tokio::select! {
            drained = self.ledger.ensure_drained(timeout) => drained,
            _ = raised.wait_for(|raised| *raised) => Ok(()),
        };

        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        drained?;

        let nacked: Vec<_> = lock(&self.nacked).drain(..).collect();
        if !nacked.is_empty() {
            warn!(nacked = nacked.len(), "messages were nack-ed by the broker");
        }

        Ok(nacked)
    }

    /// Publishes all `messages`, waiting for confirmations according to `strategy`.
    ///
    /// Each wait is bounded by `timeout`; a timeout aborts the remaining messages.
    pub async fn publish_all<I>(
        &self,
        messages: I,
        strategy: ConfirmStrategy,
        timeout: Duration,
    ) -> Result<ConfirmReport, AmqpError>
    where
        I: IntoIterator<Item = PublishMessage> + Send,
        I::IntoIter: Send,
    {
        let batch_size = match strategy {
            ConfirmStrategy::Individually => 1,
            ConfirmStrategy::Batch(size) => size.max(1),
            ConfirmStrategy::Asynchronously => usize::MAX,
        };

        let mut report = ConfirmReport::default();
        let mut pending = 0;

        for msg in messages {
            self.publish(msg).await?;
            report.published += 1;
            pending += 1;

            if pending == batch_size {
                report.nacked.extend(self.wait_for_confirms(timeout).await?);
                pending = 0;
            }
        }

        if pending > 0 {
            report.nacked.extend(self.wait_for_confirms(timeout).await?);
        }

        debug!(
            published = report.published,
            nacked = report.nacked.len(),
            ?strategy,
            "publish finished"
        );

        Ok(report)
    }
}

impl<C> Drop for ConfirmPublisher<C> {
    fn drop(&mut self) {
        self.reconciler.abort();
    }
}

async fn reconcile(
    ledger: Arc<ConfirmLedger<PublishMessage>>,
    nacked: Nacked,
    fault: Arc<Fault>,
    mut events: UnboundedReceiver<ConfirmEvent>,
) {
    while let Some(event) = events.recv().await {
        // nacks are collected before the ledger can report itself drained
        let mut failed = lock(&nacked);

        match ledger.apply(event) {
            Ok(resolution) if resolution.outcome == Outcome::Nack => {
                for entry in &resolution.entries {
                    warn!(sequence = entry.sequence, to = %entry.message.to, "message nack-ed");
                }
                failed.extend(resolution.entries);
            }
            Ok(_) => {}
            Err(err) => fault.raise(err),
        }
    }

    debug!("confirmation stream closed");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
