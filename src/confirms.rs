// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publisher Confirm Tracking
//!
//! Once a channel is in confirm mode, every message published on it gets a
//! sequence number starting at 1, and the broker later acks or nacks those
//! numbers, either one at a time or cumulatively ("everything up to N").
//!
//! `ConfirmLedger` keeps the messages that are still waiting for a
//! confirmation. Publishing paths call [`ConfirmLedger::record_publish`], the
//! connection's delivery path calls [`ConfirmLedger::apply_confirmation`], and
//! a publisher can wait for the outstanding set to drain with
//! [`ConfirmLedger::await_drained`]. One ledger belongs to one channel.

use crate::errors::AmqpError;
use std::{collections::BTreeMap, mem, sync::Mutex, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Whether the broker took responsibility for the messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Ack,
    Nack,
}

/// A confirmation received from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmEvent {
    pub sequence: u64,
    /// Resolves every outstanding sequence number up to and including `sequence`.
    pub multiple: bool,
    pub outcome: Outcome,
}

impl ConfirmEvent {
    /// A positive confirmation of `sequence` alone.
    pub fn ack(sequence: u64) -> ConfirmEvent {
        ConfirmEvent {
            sequence,
            multiple: false,
            outcome: Outcome::Ack,
        }
    }

    /// A negative confirmation of `sequence` alone.
    pub fn nack(sequence: u64) -> ConfirmEvent {
        ConfirmEvent {
            sequence,
            multiple: false,
            outcome: Outcome::Nack,
        }
    }

    /// Makes the confirmation cumulative.
    pub fn multiple(mut self) -> ConfirmEvent {
        self.multiple = true;
        self
    }
}

/// A published message waiting for its confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outstanding<T> {
    pub sequence: u64,
    pub message: T,
}

/// The entries removed from the ledger by one confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution<T> {
    pub outcome: Outcome,
    pub entries: Vec<Outstanding<T>>,
}

impl<T> Resolution<T> {
    /// Returns true when the broker acked the entries.
    pub fn is_ack(&self) -> bool {
        self.outcome == Outcome::Ack
    }

    /// Returns the resolved sequence numbers in ascending order.
    pub fn sequences(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.sequence).collect()
    }
}

#[derive(Debug)]
struct LedgerState<T> {
    next: u64,
    entries: BTreeMap<u64, T>,
}

/// Ordered ledger of unconfirmed messages keyed by sequence number.
#[derive(Debug)]
pub struct ConfirmLedger<T> {
    state: Mutex<LedgerState<T>>,
    // outstanding count, republished on every insert and removal
    outstanding: watch::Sender<usize>,
}

impl<T> Default for ConfirmLedger<T> {
    fn default() -> Self {
        ConfirmLedger::new()
    }
}

impl<T> ConfirmLedger<T> {
    /// Creates an empty ledger whose first sequence number is 1.
    pub fn new() -> ConfirmLedger<T> {
        let (outstanding, _) = watch::channel(0);
        ConfirmLedger {
            state: Mutex::new(LedgerState {
                next: 1,
                entries: BTreeMap::new(),
            }),
            outstanding,
        }
    }

    /// Stores `message` under the next sequence number and returns that number.
    ///
    /// Numbers start at 1 and increase by one per call, also when called
    /// concurrently.
    pub fn record_publish(&self, message: T) -> u64 {
        let mut state = self.lock();
        let sequence = state.next;
        state.next += 1;
        state.entries.insert(sequence, message);
        self.outstanding.send_replace(state.entries.len());

        sequence
    }

    /// Removes the entries resolved by a confirmation and returns them.
    ///
    /// With `multiple` every entry up to and including `sequence` is removed,
    /// otherwise only `sequence` itself. A number that was issued but is no
    /// longer outstanding resolves nothing.
    ///
    /// # Errors
    /// `UnknownSequenceNumber` when `sequence` was never issued by this ledger.
    pub fn apply_confirmation(
        &self,
        sequence: u64,
        multiple: bool,
        outcome: Outcome,
    ) -> Result<Resolution<T>, AmqpError> {
        let mut state = self.lock();

        if sequence == 0 || sequence >= state.next {
            error!(sequence, next = state.next, "confirmation for unknown sequence number");
            return Err(AmqpError::UnknownSequenceNumber(sequence));
        }

        let entries: Vec<Outstanding<T>> = if multiple {
            let remaining = state.entries.split_off(&(sequence + 1));
            mem::replace(&mut state.entries, remaining)
                .into_iter()
                .map(|(sequence, message)| Outstanding { sequence, message })
                .collect()
        } else {
            state
                .entries
                .remove(&sequence)
                .map(|message| Outstanding { sequence, message })
                .into_iter()
                .collect()
        };

        if entries.is_empty() {
            warn!(sequence, multiple, "confirmation resolved no outstanding message");
        } else {
            debug!(sequence, multiple, resolved = entries.len(), ?outcome, "confirmation applied");
            self.outstanding.send_replace(state.entries.len());
        }

        Ok(Resolution { outcome, entries })
    }

    /// Applies a confirmation event, see [`ConfirmLedger::apply_confirmation`].
    pub fn apply(&self, event: ConfirmEvent) -> Result<Resolution<T>, AmqpError> {
        self.apply_confirmation(event.sequence, event.multiple, event.outcome)
    }

    /// Returns true when no message is waiting for a confirmation.
    pub fn is_drained(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of messages still waiting for a confirmation.
    pub fn outstanding(&self) -> usize {
        self.lock().entries.len()
    }

    /// The sequence number the next publish will get.
    pub fn next_sequence(&self) -> u64 {
        self.lock().next
    }

    /// Waits until no message is outstanding or `timeout` elapses.
    ///
    /// Returns whether the ledger drained. The condition is re-checked each
    /// time a confirmation removes entries, so the wait ends as soon as the
    /// last one arrives. A zero timeout only checks the current state.
    pub async fn await_drained(&self, timeout: Duration) -> bool {
        let mut outstanding = self.outstanding.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, outstanding.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );

        drained
    }

    /// Like [`ConfirmLedger::await_drained`] but fails when the deadline passes.
    ///
    /// # Errors
    /// `DrainTimeout` with the number of messages still unconfirmed.
    pub async fn ensure_drained(&self, timeout: Duration) -> Result<(), AmqpError> {
        if self.await_drained(timeout).await {
            return Ok(());
        }

        let outstanding = self.outstanding();
        error!(outstanding, timeout_ms = timeout.as_millis() as u64, "messages not confirmed in time");
        Err(AmqpError::DrainTimeout {
            outstanding,
            timeout_ms: timeout.as_millis(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState<T>> {
        // the state stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Arc, thread, time::Instant};

    fn ledger_with(count: u64) -> ConfirmLedger<String> {
        let ledger = ConfirmLedger::new();
        for i in 1..=count {
            assert_eq!(ledger.record_publish(format!("msg-{}", i)), i);
        }
        ledger
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let ledger = ledger_with(3);
        assert_eq!(ledger.next_sequence(), 4);
        assert_eq!(ledger.outstanding(), 3);
        assert!(!ledger.is_drained());
        assert!(ConfirmLedger::<()>::new().is_drained());
    }

    #[test]
    fn test_single_ack_removes_one_entry() {
        let ledger = ledger_with(3);
        let resolution = ledger.apply_confirmation(2, false, Outcome::Ack).unwrap();
        assert!(resolution.is_ack());
        assert_eq!(
            resolution.entries,
            vec![Outstanding {
                sequence: 2,
                message: "msg-2".to_owned()
            }]
        );
        assert_eq!(ledger.outstanding(), 2);
    }

    #[test]
    fn test_already_resolved_sequence_is_a_no_op() {
        let ledger = ledger_with(2);
        ledger.apply(ConfirmEvent::ack(1)).unwrap();
        let resolution = ledger.apply(ConfirmEvent::ack(1)).unwrap();
        assert!(resolution.entries.is_empty());
        assert_eq!(ledger.outstanding(), 1);
    }

    #[test]
    fn test_unknown_sequence_is_reported() {
        let ledger = ledger_with(2);
        assert_eq!(
            ledger.apply(ConfirmEvent::ack(3)),
            Err(AmqpError::UnknownSequenceNumber(3))
        );
        assert_eq!(
            ledger.apply(ConfirmEvent::nack(0).multiple()),
            Err(AmqpError::UnknownSequenceNumber(0))
        );
        assert_eq!(ledger.outstanding(), 2);
    }

    #[test]
    fn test_cumulative_ack_drains_everything_once() {
        let ledger = ledger_with(10);
        let resolution = ledger.apply(ConfirmEvent::ack(10).multiple()).unwrap();
        assert_eq!(resolution.sequences(), (1..=10).collect::<Vec<_>>());
        assert!(ledger.is_drained());

        let again = ledger.apply(ConfirmEvent::ack(10).multiple()).unwrap();
        assert!(again.entries.is_empty());
    }

    #[test]
    fn test_cumulative_ack_keeps_later_entries() {
        let ledger = ledger_with(5);
        let resolution = ledger.apply(ConfirmEvent::ack(3).multiple()).unwrap();
        assert_eq!(resolution.sequences(), vec![1, 2, 3]);
        assert_eq!(ledger.outstanding(), 2);
        assert_eq!(ledger.record_publish("msg-6".to_owned()), 6);
    }

    #[test]
    fn test_nack_then_cumulative_ack() {
        let ledger = ledger_with(5);

        let nacked = ledger.apply(ConfirmEvent::nack(3)).unwrap();
        assert_eq!(nacked.outcome, Outcome::Nack);
        assert_eq!(nacked.sequences(), vec![3]);
        assert_eq!(nacked.entries[0].message, "msg-3");

        let acked = ledger.apply(ConfirmEvent::ack(5).multiple()).unwrap();
        assert_eq!(acked.outcome, Outcome::Ack);
        assert_eq!(acked.sequences(), vec![1, 2, 4, 5]);
        assert!(ledger.is_drained());
    }

    #[test]
    fn test_concurrent_publishes_get_unique_numbers() {
        let ledger = Arc::new(ConfirmLedger::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let mut numbers = vec![];
                    for i in 0..250 {
                        let sequence = ledger.record_publish((t, i));
                        numbers.push(sequence);
                        if i % 10 == 0 {
                            ledger.apply(ConfirmEvent::ack(sequence).multiple()).unwrap();
                        }
                    }
                    numbers
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in threads {
            let numbers = handle.join().unwrap();
            assert!(numbers.windows(2).all(|w| w[0] < w[1]));
            for n in numbers {
                assert!(all.insert(n), "sequence {} issued twice", n);
            }
        }

        assert_eq!(all, (1..=2000).collect::<HashSet<u64>>());
        assert_eq!(ledger.next_sequence(), 2001);
    }

    #[tokio::test]
    async fn test_await_drained_zero_timeout_returns_immediately() {
        let ledger = ledger_with(1);
        let started = Instant::now();
        assert!(!ledger.await_drained(Duration::ZERO).await);
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(ConfirmLedger::<()>::new().await_drained(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_await_drained_wakes_on_confirmation() {
        let ledger = Arc::new(ledger_with(3));

        let confirmer = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ledger.apply(ConfirmEvent::ack(1)).unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                ledger.apply(ConfirmEvent::ack(3).multiple()).unwrap();
            })
        };

        let started = Instant::now();
        assert!(ledger.await_drained(Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        confirmer.await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_drained_times_out() {
        let ledger = ledger_with(4);
        ledger.apply(ConfirmEvent::ack(2).multiple()).unwrap();

        let started = Instant::now();
        let result = ledger.ensure_drained(Duration::from_millis(50)).await;
        assert_eq!(
            result,
            Err(AmqpError::DrainTimeout {
                outstanding: 2,
                timeout_ms: 50
            })
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
