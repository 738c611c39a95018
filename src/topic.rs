//! Topic routing algebra.
//!
//! Routing keys and binding patterns are dot-separated segment sequences.
//! A pattern segment is either a literal, which must equal the key segment,
//! or the wildcard `*`, which matches exactly one segment.
//!
//! ```
//! use topic_bus::topic::matches;
//!
//! assert!(matches("customer.create_customer", "customer.*"));
//! assert!(!matches("customer.create.nested", "customer.*"));
//! assert!(!matches("customer", "customer.*"));
//! ```

use std::fmt;

/// Segment separator.
pub const SEPARATOR: char = '.';

/// Single-segment wildcard.
pub const WILDCARD: &str = "*";

/// Returns `true` if `routing_key` is matched by `pattern`.
///
/// Both must have the same number of segments and every pattern segment must
/// be `*` or equal to the corresponding key segment.
pub fn matches(routing_key: &str, pattern: &str) -> bool {
    let mut keys = routing_key.split(SEPARATOR);
    let mut pats = pattern.split(SEPARATOR);

    loop {
        match (keys.next(), pats.next()) {
            (None, None) => return true,
            (Some(k), Some(p)) => {
                if p != WILDCARD && p != k {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Syntax errors in routing keys and binding patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("topic is empty")]
    Empty,

    #[error("`{0}` contains an empty segment")]
    EmptySegment(String),

    #[error("`{0}` uses `*` inside a segment; the wildcard must be a whole segment")]
    PartialWildcard(String),

    #[error("routing key `{0}` contains a wildcard")]
    WildcardInKey(String),
}

fn check_segments(raw: &str) -> Result<(), TopicError> {
    if raw.is_empty() {
        return Err(TopicError::Empty);
    }
    for segment in raw.split(SEPARATOR) {
        if segment.is_empty() {
            return Err(TopicError::EmptySegment(raw.to_string()));
        }
        if segment != WILDCARD && segment.contains('*') {
            return Err(TopicError::PartialWildcard(raw.to_string()));
        }
    }
    Ok(())
}

/// A validated binding pattern, e.g. `product.*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingPattern(String);

impl BindingPattern {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        check_segments(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of dot-separated segments.
    pub fn segments(&self) -> usize {
        self.0.split(SEPARATOR).count()
    }

    pub fn matches(&self, routing_key: &RoutingKey) -> bool {
        matches(routing_key.as_str(), &self.0)
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated routing key, e.g. `product.create_product`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn parse(raw: impl Into<String>) -> Result<Self, TopicError> {
        let raw = raw.into();
        check_segments(&raw)?;
        if raw.split(SEPARATOR).any(|s| s == WILDCARD) {
            return Err(TopicError::WildcardInKey(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
