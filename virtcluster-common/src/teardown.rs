//! Outcome of best-effort cleanup

use serde::{Deserialize, Serialize};

/// One resource that could not be removed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownFailure {
    pub resource: String,
    pub reason: String,
}

/// Every deletion attempted during a teardown, in order
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_removed(&mut self, resource: impl Into<String>) {
        self.removed.push(resource.into());
    }

    pub fn record_failure(&mut self, resource: impl Into<String>, reason: impl std::fmt::Display) {
        self.failures.push(TeardownFailure {
            resource: resource.into(),
            reason: reason.to_string(),
        });
    }

    /// Append another report after this one
    pub fn merge(&mut self, other: TeardownReport) {
        self.removed.extend(other.removed);
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Convert into an error when anything failed
    pub fn into_result(self) -> crate::Result<TeardownReport> {
        if self.is_clean() {
            return Ok(self);
        }

        let summary = self
            .failures
            .iter()
            .map(|f| format!("{} ({})", f.resource, f.reason))
            .collect::<Vec<_>>()
            .join(", ");

        Err(crate::Error::TeardownPartialFailure(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_order() {
        let mut first = TeardownReport::new();
        first.record_removed("domain/a");
        first.record_failure("domain/b", "busy");

        let mut second = TeardownReport::new();
        second.record_removed("network/global");

        first.merge(second);
        assert_eq!(first.removed, vec!["domain/a", "network/global"]);
        assert_eq!(first.failures.len(), 1);
        assert!(!first.is_clean());
    }

    #[test]
    fn test_into_result() {
        assert!(TeardownReport::new().into_result().is_ok());

        let mut report = TeardownReport::new();
        report.record_failure("volume/x.img", "permission denied");
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("volume/x.img (permission denied)"));
    }
}
