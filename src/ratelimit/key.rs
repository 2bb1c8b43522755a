//! Namespaced state keys.

use serde::{Deserialize, Serialize};

/// The algorithm a piece of state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    SlidingLog,
    TokenBucket,
    LeakyBucket,
    Throttling,
}

impl Algorithm {
    /// Key prefix used for this algorithm's state.
    pub fn prefix(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fw",
            Algorithm::SlidingWindow => "sw",
            Algorithm::SlidingLog => "sl",
            Algorithm::TokenBucket => "tb",
            Algorithm::LeakyBucket => "lb",
            Algorithm::Throttling => "th",
        }
    }

    /// Human readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::SlidingLog => "sliding_log",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::Throttling => "throttling",
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one caller's state for one limiter.
///
/// Rendered as `<algorithm-prefix>:<limiter-name>:<caller-key>` so that
/// distinct limiters sharing a store never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    /// The algorithm owning the state
    pub algorithm: Algorithm,
    /// Name of the limiter instance
    pub limiter: String,
    /// Caller-supplied key
    pub key: String,
}

impl StateKey {
    /// Create a new state key.
    pub fn new(algorithm: Algorithm, limiter: &str, key: &str) -> Self {
        Self {
            algorithm,
            limiter: limiter.to_string(),
            key: key.to_string(),
        }
    }

    /// The string form stored in the backend.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}:{}", self.algorithm.prefix(), self.limiter, self.key)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_key_format() {
        let key = StateKey::new(Algorithm::TokenBucket, "api", "user:42");
        assert_eq!(key.to_string_key(), "tb:api:user:42");
        assert_eq!(key.to_string(), "tb:api:user:42");
    }

    #[test]
    fn test_state_keys_do_not_collide_across_algorithms() {
        let a = StateKey::new(Algorithm::FixedWindow, "api", "k").to_string_key();
        let b = StateKey::new(Algorithm::SlidingWindow, "api", "k").to_string_key();
        let c = StateKey::new(Algorithm::FixedWindow, "other", "k").to_string_key();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_algorithm_serde_names() {
        let parsed: Algorithm = serde_yaml::from_str("leaky_bucket").unwrap();
        assert_eq!(parsed, Algorithm::LeakyBucket);
        assert_eq!(parsed.to_string(), "leaky_bucket");
    }
}
