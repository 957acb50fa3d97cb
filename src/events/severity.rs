use serde::{Deserialize, Serialize};

/// Severity of an authentication event. Drives retention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Never pruned
    Critical,
    /// Kept for 90 days
    #[default]
    Important,
    /// Kept for 7 days
    Noise,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }

    /// Days an event of this severity is retained; `None` means forever.
    pub fn retention_days(&self) -> Option<i64> {
        match self {
            Severity::Critical => None,
            Severity::Important => Some(90),
            Severity::Noise => Some(7),
        }
    }
}
