//! DMARC policy record parsing (RFC 7489 §6.3).

use std::fmt;

use crate::error::AuthError;
use crate::tags::TagList;

/// Requested handling for non-aligned mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    fn parse(value: &str) -> Result<Self, AuthError> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(Policy::None),
            "quarantine" => Ok(Policy::Quarantine),
            "reject" => Ok(Policy::Reject),
            other => Err(AuthError::MalformedTagList(format!(
                "invalid DMARC policy: {other}"
            ))),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Policy::None => "none",
            Policy::Quarantine => "quarantine",
            Policy::Reject => "reject",
        })
    }
}

/// Identifier alignment mode: relaxed compares organizational
/// domains, strict requires equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

impl AlignmentMode {
    fn parse(value: &str) -> Result<Self, AuthError> {
        match value.to_ascii_lowercase().as_str() {
            "r" => Ok(AlignmentMode::Relaxed),
            "s" => Ok(AlignmentMode::Strict),
            other => Err(AuthError::MalformedTagList(format!(
                "invalid alignment mode: {other}"
            ))),
        }
    }
}

/// A parsed `_dmarc` TXT record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcRecord {
    pub policy: Policy,
    pub subdomain_policy: Option<Policy>,
    pub adkim: AlignmentMode,
    pub aspf: AlignmentMode,
    /// Sampling percentage, 0–100.
    pub pct: u8,
    pub rua: Vec<String>,
    pub ruf: Vec<String>,
    /// Failure reporting options (`fo=`), default `0`.
    pub fo: String,
    pub raw: String,
}

impl DmarcRecord {
    pub fn is_dmarc(txt: &str) -> bool {
        let t = txt.trim_start();
        t.len() >= 8 && t[..8].eq_ignore_ascii_case("v=DMARC1")
    }

    pub fn parse(txt: &str) -> Result<Self, AuthError> {
        let tags = TagList::parse(txt)?;

        // v=DMARC1 must be the first tag.
        match tags.iter().next() {
            Some(tag) if tag.name == "v" && tag.value.eq_ignore_ascii_case("DMARC1") => {}
            _ => {
                return Err(AuthError::MalformedTagList(
                    "record does not start with v=DMARC1".into(),
                ))
            }
        }

        let policy = Policy::parse(
            tags.get("p")
                .ok_or_else(|| AuthError::MalformedTagList("missing p= tag".into()))?,
        )?;

        let pct = match tags.get("pct") {
            None => 100,
            Some(v) => {
                let pct: u8 = v.parse().map_err(|_| {
                    AuthError::MalformedTagList(format!("invalid pct= value: {v}"))
                })?;
                pct.min(100)
            }
        };

        let uris = |name: &str| {
            tags.get(name)
                .map(|v| {
                    v.split(',')
                        .map(|u| u.trim().to_string())
                        .filter(|u| !u.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(DmarcRecord {
            policy,
            subdomain_policy: tags.get("sp").map(Policy::parse).transpose()?,
            adkim: tags.get("adkim").map(AlignmentMode::parse).transpose()?.unwrap_or_default(),
            aspf: tags.get("aspf").map(AlignmentMode::parse).transpose()?.unwrap_or_default(),
            pct,
            rua: uris("rua"),
            ruf: uris("ruf"),
            fo: tags.get("fo").unwrap_or("0").to_string(),
            raw: txt.trim().to_string(),
        })
    }
}
