//! A limiter that admits everything.

use async_trait::async_trait;

use super::{Decision, RateLimiter};
use crate::error::Result;

/// Always admits and keeps no state. Useful for disabling rate limiting
/// without changing call sites, and in tests.
#[derive(Debug, Clone)]
pub struct Unlimited {
    name: String,
}

impl Unlimited {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl RateLimiter for Unlimited {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _key: &str) -> Result<Decision> {
        Ok(Decision::allowed(u64::MAX))
    }

    async fn remaining(&self, _key: &str) -> Result<u64> {
        Ok(u64::MAX)
    }

    async fn reset(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}
