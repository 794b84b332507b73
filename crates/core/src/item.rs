//! Per-item processing outcomes and scan modes.

use serde::{Deserialize, Serialize};

/// How the items of a job are processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// First scan of freshly ingested items
    #[default]
    Scan,
    /// Re-scan of known items with change detection
    Rescan,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Scan => "scan",
            ScanMode::Rescan => "rescan",
        }
    }
}

impl core::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The item was processed; `result` is stored in the job's results map.
    Success(serde_json::Value),
    /// The item could not be processed.
    ///
    /// `retryable` marks transient storage contention (lock wait, deadlock)
    /// that is worth another attempt.
    Failure { error: String, retryable: bool },
}

impl ItemOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self::Success(result)
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn contention(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ItemOutcome::Failure { retryable: true, .. })
    }
}
