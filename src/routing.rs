// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Local Exchange Routing
//!
//! This module simulates how an exchange delivers a message to its bound
//! destinations. It is used to check topologies before installing them and as
//! a broker substitute in tests.
//!
//! A message is delivered once per distinct destination: if several bindings of
//! the same destination match, the destination still receives one copy.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    topic::{Pattern, RoutingKey},
};
use std::{collections::HashSet, hash::Hash};
use tracing::debug;

/// A binding of a destination to an exchange under a binding key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding<D> {
    key: String,
    pattern: Pattern,
    destination: D,
}

impl<D> Binding<D> {
    /// Returns the binding key as declared.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the binding key parsed as a topic pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Returns the destination receiving the matching messages.
    pub fn destination(&self) -> &D {
        &self.destination
    }

    fn accepts(&self, kind: ExchangeKind, routing_key: &str, words: &RoutingKey) -> bool {
        match kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => self.key == routing_key,
            ExchangeKind::Topic => self.pattern.matches(words),
        }
    }
}

/// The bindings of a single exchange.
#[derive(Debug, Clone)]
pub struct RoutingTable<D> {
    kind: ExchangeKind,
    bindings: Vec<Binding<D>>,
}

impl<D> RoutingTable<D>
where
    D: Clone + Eq + Hash,
{
    /// Creates an empty routing table for an exchange of the given type.
    pub fn new(kind: ExchangeKind) -> RoutingTable<D> {
        RoutingTable {
            kind,
            bindings: vec![],
        }
    }

    /// Returns the exchange type driving the routing.
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Returns the bindings in declaration order.
    pub fn bindings(&self) -> &[Binding<D>] {
        &self.bindings
    }

    /// Returns the number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns true when nothing is bound to the exchange.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Binds `destination` under `key`.
    ///
    /// Returns false when the same binding already exists. The key is parsed
    /// as a topic pattern whatever the exchange kind, so an invalid key is
    /// rejected up front.
    pub fn bind(&mut self, key: &str, destination: D) -> Result<bool, AmqpError> {
        if self
            .bindings
            .iter()
            .any(|b| b.key == key && b.destination == destination)
        {
            return Ok(false);
        }

        let pattern = Pattern::parse(key)?;
        self.bindings.push(Binding {
            key: key.to_owned(),
            pattern,
            destination,
        });

        Ok(true)
    }

    /// Removes the binding of `destination` under `key`.
    pub fn unbind(&mut self, key: &str, destination: &D) -> bool {
        let before = self.bindings.len();
        self.bindings
            .retain(|b| !(b.key == key && b.destination == *destination));
        before != self.bindings.len()
    }

    /// Removes every binding of `destination`, returning how many were removed.
    pub fn unbind_destination(&mut self, destination: &D) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.destination != *destination);
        before - self.bindings.len()
    }

    /// Returns the distinct destinations a message published with
    /// `routing_key` is delivered to, in first-binding order.
    pub fn route(&self, routing_key: &str) -> Vec<D> {
        let words = RoutingKey::new(routing_key);
        let mut seen = HashSet::new();
        let mut destinations = vec![];

        for binding in &self.bindings {
            if !binding.accepts(self.kind, routing_key, &words) {
                continue;
            }
            if seen.insert(binding.destination.clone()) {
                destinations.push(binding.destination.clone());
            }
        }

        if destinations.is_empty() {
            debug!(routing_key, "message unroutable, dropped");
        }

        destinations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tutorial_topics() -> RoutingTable<&'static str> {
        let mut table = RoutingTable::new(ExchangeKind::Topic);
        table.bind("*.orange.*", "Q1").unwrap();
        table.bind("*.*.rabbit", "Q2").unwrap();
        table.bind("lazy.#", "Q2").unwrap();
        table
    }

    fn matching_patterns(table: &RoutingTable<&'static str>, key: &str) -> Vec<String> {
        let words = RoutingKey::new(key);
        table
            .bindings()
            .iter()
            .filter(|b| b.pattern().matches(&words))
            .map(|b| b.key().to_owned())
            .collect()
    }

    #[test]
    fn test_topic_patterns_for_lazy_orange_elephant() {
        let table = tutorial_topics();
        assert_eq!(
            matching_patterns(&table, "lazy.orange.elephant"),
            vec!["*.orange.*", "lazy.#"]
        );
        assert_eq!(table.route("lazy.orange.elephant"), vec!["Q1", "Q2"]);
    }

    #[test]
    fn test_quick_brown_fox_is_dropped() {
        let table = tutorial_topics();
        assert!(matching_patterns(&table, "quick.brown.fox").is_empty());
        assert!(table.route("quick.brown.fox").is_empty());
    }

    #[test]
    fn test_destination_receives_one_copy() {
        let table = tutorial_topics();
        // matches both of Q2's patterns
        assert_eq!(table.route("lazy.pink.rabbit"), vec!["Q2"]);
        assert_eq!(table.route("quick.orange.rabbit"), vec!["Q1", "Q2"]);
        assert_eq!(table.route("lazy.orange.male.rabbit"), vec!["Q2"]);
        assert!(table.route("quick.orange.male.rabbit").is_empty());
    }

    #[test]
    fn test_direct_routing_is_exact() {
        let mut table = RoutingTable::new(ExchangeKind::Direct);
        table.bind("error", "disk").unwrap();
        table.bind("info", "console").unwrap();
        table.bind("warning", "console").unwrap();
        table.bind("error", "console").unwrap();

        assert_eq!(table.route("error"), vec!["disk", "console"]);
        assert_eq!(table.route("info"), vec!["console"]);
        assert!(table.route("debug").is_empty());
        // wildcards carry no meaning on a direct exchange
        table.bind("#", "all").unwrap();
        assert_eq!(table.route("info"), vec!["console"]);
        assert_eq!(table.route("#"), vec!["all"]);
    }

    #[test]
    fn test_fanout_ignores_routing_key() {
        let mut table = RoutingTable::new(ExchangeKind::Fanout);
        table.bind("", "a").unwrap();
        table.bind("ignored", "b").unwrap();
        table.bind("other", "a").unwrap();

        assert_eq!(table.route(""), vec!["a", "b"]);
        assert_eq!(table.route("anything.at.all"), vec!["a", "b"]);
    }

    #[test]
    fn test_hash_binding_receives_everything() {
        let mut table = RoutingTable::new(ExchangeKind::Topic);
        table.bind("#", "all").unwrap();
        assert_eq!(table.route(""), vec!["all"]);
        assert_eq!(table.route("a.b.c"), vec!["all"]);
    }

    #[test]
    fn test_bind_is_idempotent_and_unbind() {
        let mut table = tutorial_topics();
        assert!(!table.bind("lazy.#", "Q2").unwrap());
        assert_eq!(table.len(), 3);

        assert!(table.unbind("lazy.#", &"Q2"));
        assert!(!table.unbind("lazy.#", &"Q2"));
        assert!(table.route("lazy.brown.fox").is_empty());

        assert_eq!(table.unbind_destination(&"Q2"), 1);
        assert_eq!(table.unbind_destination(&"Q1"), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_bind_rejects_malformed_pattern() {
        let mut table: RoutingTable<&str> = RoutingTable::new(ExchangeKind::Topic);
        let result = table.bind(&"x".repeat(300), "Q");
        assert!(matches!(result, Err(AmqpError::MalformedPattern { .. })));
        assert!(table.is_empty());
    }
}
