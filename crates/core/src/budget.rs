//! Per-run token accounting.

use serde::{Deserialize, Serialize};

/// Tokens consumed by one run against its limit.
///
/// `used` only grows. Only model-call accounting (agent turns, argument
/// repairs, summarization) charges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    used: u64,
    limit: u64,
}

impl TokenBudget {
    pub fn new(limit: u64) -> Self {
        Self { used: 0, limit }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    /// Record tokens spent by a model call.
    pub fn charge(&mut self, tokens: u64) {
        self.used = self.used.saturating_add(tokens);
    }

    /// No further model call may start.
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    /// The limit was overrun by the last charge.
    pub fn is_exceeded(&self) -> bool {
        self.used > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_limit_is_exhausted_not_exceeded() {
        let mut budget = TokenBudget::new(100);
        budget.charge(60);
        assert!(!budget.is_exhausted());
        budget.charge(40);
        assert!(budget.is_exhausted());
        assert!(!budget.is_exceeded());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn overrun_is_exceeded() {
        let mut budget = TokenBudget::new(10);
        budget.charge(11);
        assert!(budget.is_exceeded());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn charge_saturates() {
        let mut budget = TokenBudget::new(u64::MAX);
        budget.charge(u64::MAX);
        budget.charge(5);
        assert_eq!(budget.used(), u64::MAX);
    }
}
