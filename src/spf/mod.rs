//! SPF evaluation (RFC 7208).

pub mod eval;
pub mod macro_exp;
pub mod record;

pub use eval::SpfVerifier;
pub use record::{Qualifier, SpfRecord, SpfTerm};

use std::fmt;
use std::net::IpAddr;

/// SPF result codes (RFC 7208 §2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        })
    }
}

/// Full evaluation outcome, with everything header emission needs.
#[derive(Debug, Clone)]
pub struct SpfVerdict {
    pub result: SpfResult,
    /// Domain the final verdict applies to (after redirects).
    pub domain: String,
    /// Envelope sender, with `postmaster` filled in when absent.
    pub sender: String,
    pub client_ip: IpAddr,
    pub helo: String,
    /// Matched mechanism with its qualifier, e.g. `-all` or `mx`.
    pub mechanism: Option<String>,
    /// `exp=` text on fail, or an error detail for the comment field.
    pub explanation: Option<String>,
    /// The SPF record that produced the verdict.
    pub record: Option<String>,
    /// Total DNS queries charged during evaluation.
    pub lookups: usize,
}

impl SpfVerdict {
    pub fn is_pass(&self) -> bool {
        self.result == SpfResult::Pass
    }
}
