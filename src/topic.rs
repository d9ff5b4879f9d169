// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Pattern Matching
//!
//! This module implements the routing-key matching performed by topic exchanges.
//! Binding keys and routing keys are dot-separated words; in a binding key a `*`
//! word matches exactly one routing-key word and a `#` word matches zero or more.
//!
//! A binding key of `#` receives every message (like a fanout exchange), and a
//! binding key without wildcards only receives the identical routing key (like
//! a direct exchange).

use crate::errors::AmqpError;
use std::fmt;

/// Maximum length in bytes of a binding key (AMQP short string).
pub const MAX_PATTERN_LENGTH: usize = 255;

const WORD_SEPARATOR: char = '.';
const SINGLE_WORD: &str = "*";
const MULTI_WORD: &str = "#";

/// A single word of a binding key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Matches the identical word, the empty word included
    Literal(String),
    /// `*`: matches exactly one word
    Star,
    /// `#`: matches zero or more words
    Hash,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(word) => f.write_str(word),
            Segment::Star => f.write_str(SINGLE_WORD),
            Segment::Hash => f.write_str(MULTI_WORD),
        }
    }
}

/// A parsed binding key.
///
/// Patterns are immutable once parsed and can be shared freely between threads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a binding key into its segments.
    ///
    /// The empty string is the pattern with no segments, which only matches
    /// the empty routing key. Consecutive dots produce empty literal words.
    ///
    /// # Errors
    /// `MalformedPattern` when the key is longer than [`MAX_PATTERN_LENGTH`] bytes.
    pub fn parse(pattern: &str) -> Result<Pattern, AmqpError> {
        if pattern.len() > MAX_PATTERN_LENGTH {
            return Err(AmqpError::MalformedPattern {
                pattern: pattern.to_owned(),
                reason: format!("longer than {} bytes", MAX_PATTERN_LENGTH),
            });
        }

        let segments = split_words(pattern)
            .map(|word| match word {
                SINGLE_WORD => Segment::Star,
                MULTI_WORD => Segment::Hash,
                other => Segment::Literal(other.to_owned()),
            })
            .collect();

        Ok(Pattern { segments })
    }

    /// Returns the segments of the pattern, in binding-key order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true when the pattern contains a `*` or `#` segment.
    pub fn has_wildcards(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Star | Segment::Hash))
    }

    /// Decides whether the routing key matches this pattern.
    ///
    /// `reachable[j]` holds whether the segments after the current one can
    /// consume `words[j..]`. The table is filled from the last segment
    /// backwards, so each (segment, word) pair is visited once and adjacent
    /// `#` segments cannot cause repeated exploration.
    pub fn matches(&self, key: &RoutingKey) -> bool {
        let words = key.words();
        let n = words.len();

        let mut reachable = vec![false; n + 1];
        reachable[n] = true;

        for segment in self.segments.iter().rev() {
            let mut current = vec![false; n + 1];
            match segment {
                Segment::Hash => {
                    current[n] = reachable[n];
                    for j in (0..n).rev() {
                        current[j] = reachable[j] || current[j + 1];
                    }
                }
                Segment::Star => {
                    for j in 0..n {
                        current[j] = reachable[j + 1];
                    }
                }
                Segment::Literal(literal) => {
                    for j in 0..n {
                        current[j] = reachable[j + 1] && words[j] == *literal;
                    }
                }
            }
            reachable = current;
        }

        reachable[0]
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", WORD_SEPARATOR)?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

/// The words of a message routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RoutingKey {
    words: Vec<String>,
}

impl RoutingKey {
    /// Splits a routing key into words. The empty string has no words.
    pub fn new(key: &str) -> RoutingKey {
        RoutingKey {
            words: split_words(key).map(str::to_owned).collect(),
        }
    }

    /// Returns the words of the routing key.
    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// Returns true for the empty routing key, which has no words.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        RoutingKey::new(key)
    }
}

/// Decides whether `key` matches `pattern`.
pub fn matches(pattern: &Pattern, key: &RoutingKey) -> bool {
    pattern.matches(key)
}

fn split_words(value: &str) -> impl Iterator<Item = &str> {
    // "" has no words; "a..b" has an empty middle word
    let mut words = value.split(WORD_SEPARATOR);
    if value.is_empty() {
        words.next();
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(pattern: &str, key: &str) -> bool {
        Pattern::parse(pattern).unwrap().matches(&RoutingKey::new(key))
    }

    #[test]
    fn test_parse_segments() {
        let pattern = Pattern::parse("*.orange.#").unwrap();
        assert_eq!(
            pattern.segments(),
            &[
                Segment::Star,
                Segment::Literal("orange".to_owned()),
                Segment::Hash
            ]
        );
        assert!(pattern.has_wildcards());
        assert_eq!(pattern.to_string(), "*.orange.#");
    }

    #[test]
    fn test_parse_empty_words() {
        assert!(Pattern::parse("").unwrap().segments().is_empty());

        let pattern = Pattern::parse("a..b").unwrap();
        assert_eq!(pattern.segments().len(), 3);
        assert_eq!(pattern.segments()[1], Segment::Literal(String::new()));
        assert!(!pattern.has_wildcards());
    }

    #[test]
    fn test_wildcard_characters_inside_words_are_literal() {
        let pattern = Pattern::parse("a*.#b").unwrap();
        assert!(!pattern.has_wildcards());
        assert!(check("a*.#b", "a*.#b"));
        assert!(!check("a*.#b", "ax.yb"));
    }

    #[test]
    fn test_parse_rejects_oversized_pattern() {
        let long = "a".repeat(MAX_PATTERN_LENGTH + 1);
        match Pattern::parse(&long) {
            Err(AmqpError::MalformedPattern { pattern, .. }) => assert_eq!(pattern, long),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(Pattern::parse(&"a".repeat(MAX_PATTERN_LENGTH)).is_ok());
    }

    #[test]
    fn test_exact_patterns_behave_like_direct() {
        assert!(check("quick.orange.rabbit", "quick.orange.rabbit"));
        assert!(!check("quick.orange.rabbit", "quick.orange"));
        assert!(!check("quick.orange", "quick.orange.rabbit"));
        assert!(!check("quick.orange.rabbit", "quick.orange.fox"));
        assert!(check("", ""));
        assert!(!check("", "a"));
        assert!(check("a..b", "a..b"));
        assert!(!check("a..b", "a.b"));
    }

    #[test]
    fn test_hash_alone_matches_everything() {
        for key in ["", "a", "a.b", "lazy.orange.elephant", "a..b", "."] {
            assert!(check("#", key), "{} should match #", key);
        }
    }

    #[test]
    fn test_star_consumes_exactly_one_word() {
        assert!(check("*.orange.*", "quick.orange.rabbit"));
        assert!(check("*.orange.*", "lazy.orange.elephant"));
        assert!(!check("*.orange.*", "quick.brown.fox"));
        assert!(!check("*.orange.*", "orange"));
        assert!(!check("*.orange.*", "quick.orange.male.rabbit"));
        assert!(!check("*", ""));
        assert!(check("*", "anything"));
    }

    #[test]
    fn test_trailing_hash_accepts_zero_words() {
        assert!(check("lazy.#", "lazy"));
        assert!(check("lazy.#", "lazy.brown.fox"));
        assert!(check("lazy.#", "lazy.pink.rabbit"));
        assert!(!check("lazy.#", "quick.lazy"));
        assert!(!check("lazy.#", ""));
    }

    #[test]
    fn test_hash_in_the_middle() {
        assert!(check("a.#.z", "a.z"));
        assert!(check("a.#.z", "a.b.c.z"));
        assert!(!check("a.#.z", "a.b.c"));
        assert!(check("#.rabbit", "quick.orange.rabbit"));
        assert!(check("#.rabbit", "rabbit"));
        assert!(!check("#.rabbit", "rabbit.fox"));
    }

    #[test]
    fn test_mixed_wildcards() {
        assert!(check("*.#", "a"));
        assert!(!check("*.#", ""));
        assert!(check("#.*", "a.b"));
        assert!(check("#.*.#", "x"));
        assert!(!check("*.*.#", "x"));
        assert!(check("*.*.rabbit", "quick.orange.rabbit"));
        assert!(!check("*.*.rabbit", "lazy.orange.elephant"));
    }

    #[test]
    fn test_adjacent_hashes_terminate() {
        let pattern = Pattern::parse(&vec!["#"; 40].join(".")).unwrap();
        let key = RoutingKey::new(&vec!["w"; 60].join("."));
        assert!(pattern.matches(&key));

        let pattern = Pattern::parse(&format!("{}.never", vec!["#"; 40].join("."))).unwrap();
        assert!(!matches(&pattern, &key));
    }

    #[test]
    fn test_routing_key_words() {
        assert!(RoutingKey::new("").is_empty());
        assert_eq!(RoutingKey::from("a.b").words(), &["a", "b"]);
        assert_eq!(RoutingKey::new("a.").words(), &["a", ""]);
    }
}
