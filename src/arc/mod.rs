//! ARC chain validation and sealing (RFC 8617).

pub mod parse;
pub mod seal;
pub mod verify;

pub use parse::{collect_arc_sets, ArcAuthResults, ArcSeal, ArcSet};
pub use seal::{ArcSealer, SealOutput};
pub use verify::ArcVerifier;

use std::fmt;

use crate::error::AuthError;

/// The `cv=` tag of an ARC-Seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainValidation {
    None,
    Pass,
    Fail,
}

impl ChainValidation {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        match value {
            "none" => Ok(ChainValidation::None),
            "pass" => Ok(ChainValidation::Pass),
            "fail" => Ok(ChainValidation::Fail),
            other => Err(AuthError::MalformedTagList(format!(
                "invalid cv= value: {other}"
            ))),
        }
    }
}

impl fmt::Display for ChainValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainValidation::None => "none",
            ChainValidation::Pass => "pass",
            ChainValidation::Fail => "fail",
        })
    }
}

/// Overall chain status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcStatus {
    /// No ARC sets on the message.
    None,
    Pass,
    Fail,
}

impl fmt::Display for ArcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArcStatus::None => "none",
            ArcStatus::Pass => "pass",
            ArcStatus::Fail => "fail",
        })
    }
}

/// Chain validation outcome.
#[derive(Debug, Clone)]
pub struct ArcVerdict {
    pub status: ArcStatus,
    /// Highest instance on the chain; 0 when no sets exist.
    pub instance: u32,
    /// Lowest instance whose message signature still validates.
    pub oldest_pass: Option<u32>,
    /// Failure description, naming the offending instance.
    pub detail: Option<String>,
}

impl ArcVerdict {
    pub fn none() -> Self {
        ArcVerdict {
            status: ArcStatus::None,
            instance: 0,
            oldest_pass: None,
            detail: None,
        }
    }

    pub fn fail(detail: String) -> Self {
        ArcVerdict {
            status: ArcStatus::Fail,
            instance: 0,
            oldest_pass: None,
            detail: Some(detail),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == ArcStatus::Pass
    }
}
