//! DKIM signature verification and signing (RFC 6376), shared with the
//! ARC module which layers RFC 8617 semantics on the same machinery.

pub mod canon;
pub mod key;
pub mod sign;
pub mod signature;
pub mod verify;

pub use key::{DkimPublicKey, KeyType};
pub use sign::DkimSigner;
pub use signature::{Algorithm, Canonicalization, CanonicalizationMethod, DkimSignature, HashAlgorithm};
pub use verify::DkimVerifier;

use std::fmt;

/// Which signature family a header belongs to. Carries the wire header
/// name and the canonical tag emission order; DKIM and ARC signatures
/// share parsing and canonicalization but differ in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Dkim,
    ArcMessage,
    ArcSeal,
}

impl SignatureKind {
    pub fn header_name(self) -> &'static str {
        match self {
            SignatureKind::Dkim => "DKIM-Signature",
            SignatureKind::ArcMessage => "ARC-Message-Signature",
            SignatureKind::ArcSeal => "ARC-Seal",
        }
    }

    /// Tag order for emission. `b=` is always last so the header can be
    /// included in its own signing input with an empty value.
    pub fn tag_order(self) -> &'static [&'static str] {
        match self {
            SignatureKind::Dkim => &[
                "v", "a", "c", "d", "h", "i", "l", "q", "s", "t", "x", "z", "bh", "b",
            ],
            SignatureKind::ArcMessage => &[
                "i", "a", "c", "d", "h", "l", "q", "s", "t", "x", "z", "bh", "b",
            ],
            SignatureKind::ArcSeal => &["i", "a", "t", "cv", "d", "s", "b"],
        }
    }
}

/// Status of a single DKIM signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimStatus {
    Pass,
    Neutral,
    Fail,
    Policy,
    TempError,
    PermError,
    /// No DKIM-Signature header present.
    None,
}

impl fmt::Display for DkimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DkimStatus::Pass => "pass",
            DkimStatus::Neutral => "neutral",
            DkimStatus::Fail => "fail",
            DkimStatus::Policy => "policy",
            DkimStatus::TempError => "temperror",
            DkimStatus::PermError => "permerror",
            DkimStatus::None => "none",
        })
    }
}

/// Per-signature verification verdict.
#[derive(Debug, Clone)]
pub struct DkimVerdict {
    pub status: DkimStatus,
    /// Signing domain (`d=`), empty when the header did not parse.
    pub domain: String,
    /// Selector (`s=`).
    pub selector: String,
    /// Agent/user identifier (`i=`), defaulted to `@<domain>`.
    pub auid: String,
    pub algorithm: Option<Algorithm>,
    /// First 8 characters of the base64 `b=` value.
    pub signature_prefix: String,
    /// Human-readable reason for non-pass statuses.
    pub detail: Option<String>,
    /// Policy annotation, e.g. `weak-key` for undersized RSA keys.
    pub policy: Option<&'static str>,
    /// Key record carried `t=y`.
    pub testing: bool,
}

impl DkimVerdict {
    pub fn is_pass(&self) -> bool {
        self.status == DkimStatus::Pass
    }

    pub fn none() -> Self {
        DkimVerdict {
            status: DkimStatus::None,
            domain: String::new(),
            selector: String::new(),
            auid: String::new(),
            algorithm: None,
            signature_prefix: String::new(),
            detail: None,
            policy: None,
            testing: false,
        }
    }

    /// Info string in Authentication-Results property format.
    pub fn info(&self) -> String {
        let mut out = format!("dkim={}", self.status);
        if !self.auid.is_empty() {
            out.push_str(&format!(" header.i={}", self.auid));
        }
        if !self.selector.is_empty() {
            out.push_str(&format!(" header.s={}", self.selector));
        }
        if !self.signature_prefix.is_empty() {
            out.push_str(&format!(" header.b=\"{}\"", self.signature_prefix));
        }
        out
    }
}
