use serde::Serialize;
use strum::Display;

/// Final result of processing one sample. Never retried once produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SendOutcome {
    Success,
    Failure,
}

impl SendOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, SendOutcome::Success)
    }
}
