use crate::error::{Error, Result};

pub const DEFAULT_BATCHING_DEGREE: usize = 16;
pub const DEFAULT_ALLOWED_VIOLATIONS: usize = 6;

/// Construction parameters shared by the batched trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeParams {
    /// Maximum number of entries per leaf.
    pub batching_degree: usize,
    /// Violations tolerated on a search path before a chromatic tree
    /// rebalances it. Ignored by the unbalanced trees.
    pub allowed_violations: usize,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            batching_degree: DEFAULT_BATCHING_DEGREE,
            allowed_violations: DEFAULT_ALLOWED_VIOLATIONS,
        }
    }
}

impl TreeParams {
    pub fn batching_degree(mut self, b: usize) -> Self {
        self.batching_degree = b;
        self
    }

    pub fn allowed_violations(mut self, d: usize) -> Self {
        self.allowed_violations = d;
        self
    }

    /// A leaf must be able to split into two non-empty halves.
    pub fn validate(self) -> Result<Self> {
        if self.batching_degree < 2 {
            return Err(Error::InvalidBatchingDegree(self.batching_degree));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::TreeParams;
    use crate::error::Error;

    #[test]
    fn defaults() {
        let p = TreeParams::default();
        assert_eq!(p.batching_degree, 16);
        assert_eq!(p.allowed_violations, 6);
        assert_eq!(p.validate(), Ok(p));
    }

    #[test]
    fn rejects_degenerate_batches() {
        assert_eq!(
            TreeParams::default().batching_degree(1).validate(),
            Err(Error::InvalidBatchingDegree(1))
        );
        assert!(TreeParams::default().batching_degree(2).validate().is_ok());
    }
}
