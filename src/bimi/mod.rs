//! BIMI indicator discovery (draft-brand-indicators-for-message-identification).
//!
//! Strictly gated on DMARC: no indicator is ever surfaced unless DMARC
//! passed under an enforcing policy.

pub mod vmc;

pub use vmc::{parse_vmc, Vmc, VmcError};

use std::fmt;

use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver};
use crate::common::domain;
use crate::dmarc::{DmarcVerdict, Policy};
use crate::message::Message;
use crate::tags::TagList;

/// BIMI evaluation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BimiStatus {
    Pass,
    /// No BIMI record published.
    None,
    /// Record published with empty `l=` and `a=`: the domain opts out.
    Declined,
    /// Gate not met (DMARC missing or not enforcing).
    Skipped,
    TempError,
    PermError,
}

impl fmt::Display for BimiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BimiStatus::Pass => "pass",
            BimiStatus::None => "none",
            BimiStatus::Declined => "declined",
            BimiStatus::Skipped => "skipped",
            BimiStatus::TempError => "temperror",
            BimiStatus::PermError => "permerror",
        })
    }
}

/// BIMI outcome: indicator and evidence locations, never fetched here.
#[derive(Debug, Clone)]
pub struct BimiVerdict {
    pub status: BimiStatus,
    pub domain: String,
    pub selector: String,
    /// `l=` indicator URI.
    pub location: Option<String>,
    /// `a=` authority evidence (VMC) URI.
    pub authority: Option<String>,
    pub detail: Option<String>,
}

impl BimiVerdict {
    fn skipped(domain: &str, selector: &str, detail: &str) -> Self {
        BimiVerdict {
            status: BimiStatus::Skipped,
            domain: domain.to_string(),
            selector: selector.to_string(),
            location: None,
            authority: None,
            detail: Some(detail.to_string()),
        }
    }
}

/// BIMI resolver over an injected resolver.
pub struct BimiVerifier<'a, R: DnsResolver> {
    resolver: &'a R,
}

impl<'a, R: DnsResolver> BimiVerifier<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Resolve the BIMI record for a message, gated on its DMARC
    /// verdict.
    pub async fn verify(
        &self,
        message: &Message<'_>,
        from_domain: &str,
        dmarc: &DmarcVerdict,
    ) -> BimiVerdict {
        let selector = selector_from_headers(message);

        if !dmarc.is_pass() {
            return BimiVerdict::skipped(from_domain, &selector, "DMARC did not pass");
        }
        match dmarc.effective_policy() {
            Some(Policy::Quarantine) | Some(Policy::Reject) => {}
            _ => {
                return BimiVerdict::skipped(
                    from_domain,
                    &selector,
                    "DMARC policy is not an enforcing one",
                )
            }
        }

        // Author domain first, organizational domain as fallback.
        let mut outcome = self.lookup(from_domain, &selector).await;
        if outcome.status == BimiStatus::None {
            let org = domain::organizational_domain(from_domain);
            if !domain::domains_equal(&org, from_domain) {
                outcome = self.lookup(&org, &selector).await;
            }
        }

        debug!(status = %outcome.status, domain = %outcome.domain, "bimi resolved");
        outcome
    }

    async fn lookup(&self, domain: &str, selector: &str) -> BimiVerdict {
        let verdict = |status, location, authority, detail| BimiVerdict {
            status,
            domain: domain.to_string(),
            selector: selector.to_string(),
            location,
            authority,
            detail,
        };

        let ascii = match domain::to_ascii(domain) {
            Ok(ascii) => ascii,
            Err(e) => return verdict(BimiStatus::PermError, None, None, Some(e)),
        };
        let name = format!("{selector}._bimi.{ascii}");

        let records = match self.resolver.query_txt(&name).await {
            Ok(records) => records,
            Err(DnsError::NotFound) => return verdict(BimiStatus::None, None, None, None),
            Err(DnsError::TempFail(e)) => {
                return verdict(BimiStatus::TempError, None, None, Some(e))
            }
            Err(DnsError::PermFail(e)) => {
                return verdict(BimiStatus::PermError, None, None, Some(e))
            }
        };

        let Some(record) = records.iter().find(|r| is_bimi(r)) else {
            return verdict(BimiStatus::None, None, None, None);
        };

        match parse_record(record) {
            Err(e) => verdict(BimiStatus::PermError, None, None, Some(e)),
            Ok((None, None)) => verdict(BimiStatus::Declined, None, None, None),
            Ok((location, authority)) => verdict(BimiStatus::Pass, location, authority, None),
        }
    }
}

fn is_bimi(txt: &str) -> bool {
    let t = txt.trim_start();
    t.len() >= 7 && t[..7].eq_ignore_ascii_case("v=BIMI1")
}

/// Parse a BIMI assertion record into `(l, a)`.
fn parse_record(txt: &str) -> Result<(Option<String>, Option<String>), String> {
    let tags = TagList::parse(txt).map_err(|e| e.to_string())?;
    match tags.iter().next() {
        Some(tag) if tag.name == "v" && tag.value.eq_ignore_ascii_case("BIMI1") => {}
        _ => return Err("record does not start with v=BIMI1".into()),
    }

    let uri = |name: &str| -> Result<Option<String>, String> {
        match tags.get(name) {
            None => Ok(None),
            Some("") => Ok(None),
            Some(value) => {
                if !value.to_ascii_lowercase().starts_with("https://") {
                    return Err(format!("{name}= is not an https URI: {value}"));
                }
                Ok(Some(value.to_string()))
            }
        }
    };

    Ok((uri("l")?, uri("a")?))
}

/// Selector from the BIMI-Selector header, `default` otherwise.
fn selector_from_headers(message: &Message<'_>) -> String {
    let Some(header) = message.first("bimi-selector") else {
        return "default".into();
    };
    let Ok(tags) = TagList::parse(&header.value) else {
        return "default".into();
    };
    let version_ok = matches!(
        tags.iter().next(),
        Some(tag) if tag.name == "v" && tag.value.eq_ignore_ascii_case("BIMI1")
    );
    if !version_ok {
        return "default".into();
    }
    match tags.get("s") {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => "default".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;
    use crate::dmarc::{AlignedMethod, DmarcRecord, DmarcStatus};

    fn dmarc(status: DmarcStatus, policy: &str, domain: &str) -> DmarcVerdict {
        DmarcVerdict {
            status,
            domain: domain.to_string(),
            aligned: Some(AlignedMethod::Dkim),
            record: Some(DmarcRecord::parse(&format!("v=DMARC1; p={policy}")).unwrap()),
            record_domain: Some(domain.to_string()),
        }
    }

    fn plain_message() -> Vec<u8> {
        b"From: a@example.com\r\n\r\nbody\r\n".to_vec()
    }

    async fn resolve(
        resolver: &MockResolver,
        raw: &[u8],
        from_domain: &str,
        dmarc: &DmarcVerdict,
    ) -> BimiVerdict {
        let message = Message::parse(raw).unwrap();
        BimiVerifier::new(resolver)
            .verify(&message, from_domain, dmarc)
            .await
    }

    #[tokio::test]
    async fn happy_path() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "default._bimi.example.com",
            vec!["v=BIMI1; l=https://example.com/logo.svg; a=https://example.com/vmc.pem"],
        );

        let verdict = resolve(
            &resolver,
            &plain_message(),
            "example.com",
            &dmarc(DmarcStatus::Pass, "reject", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::Pass);
        assert_eq!(
            verdict.location.as_deref(),
            Some("https://example.com/logo.svg")
        );
        assert_eq!(
            verdict.authority.as_deref(),
            Some("https://example.com/vmc.pem")
        );
        assert_eq!(verdict.selector, "default");
    }

    #[tokio::test]
    async fn gated_on_dmarc_fail() {
        let resolver = MockResolver::new();
        resolver.add_txt("default._bimi.example.com", vec!["v=BIMI1; l=https://x/l.svg"]);

        let verdict = resolve(
            &resolver,
            &plain_message(),
            "example.com",
            &dmarc(DmarcStatus::Fail, "reject", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::Skipped);
    }

    #[tokio::test]
    async fn gated_on_p_none() {
        let resolver = MockResolver::new();
        resolver.add_txt("default._bimi.example.com", vec!["v=BIMI1; l=https://x/l.svg"]);

        let verdict = resolve(
            &resolver,
            &plain_message(),
            "example.com",
            &dmarc(DmarcStatus::Pass, "none", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::Skipped);
        assert!(verdict.detail.unwrap().contains("policy"));
    }

    #[tokio::test]
    async fn gated_on_sp_none_for_subdomain_mail() {
        let resolver = MockResolver::new();
        resolver.add_txt("default._bimi.mail.example.com", vec!["v=BIMI1; l=https://x/l"]);

        let verdict = DmarcVerdict {
            status: DmarcStatus::Pass,
            domain: "mail.example.com".into(),
            aligned: Some(AlignedMethod::Spf),
            record: Some(DmarcRecord::parse("v=DMARC1; p=reject; sp=none").unwrap()),
            record_domain: Some("example.com".into()),
        };
        let raw = plain_message();
        let message = Message::parse(&raw).unwrap();
        let result = BimiVerifier::new(&resolver)
            .verify(&message, "mail.example.com", &verdict)
            .await;
        assert_eq!(result.status, BimiStatus::Skipped);
    }

    #[tokio::test]
    async fn selector_header_respected() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "brand._bimi.example.com",
            vec!["v=BIMI1; l=https://example.com/brand.svg"],
        );

        let raw = b"BIMI-Selector: v=BIMI1; s=brand\r\nFrom: a@example.com\r\n\r\nbody\r\n";
        let verdict = resolve(
            &resolver,
            raw,
            "example.com",
            &dmarc(DmarcStatus::Pass, "quarantine", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::Pass);
        assert_eq!(verdict.selector, "brand");
    }

    #[tokio::test]
    async fn declination_record() {
        let resolver = MockResolver::new();
        resolver.add_txt("default._bimi.example.com", vec!["v=BIMI1; l=; a="]);

        let verdict = resolve(
            &resolver,
            &plain_message(),
            "example.com",
            &dmarc(DmarcStatus::Pass, "reject", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::Declined);
    }

    #[tokio::test]
    async fn org_domain_fallback() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "default._bimi.example.com",
            vec!["v=BIMI1; l=https://example.com/logo.svg"],
        );

        let mut gate = dmarc(DmarcStatus::Pass, "reject", "example.com");
        gate.domain = "mail.example.com".into();
        let verdict = resolve(&resolver, &plain_message(), "mail.example.com", &gate).await;
        assert_eq!(verdict.status, BimiStatus::Pass);
        assert_eq!(verdict.domain, "example.com");
    }

    #[tokio::test]
    async fn non_https_uri_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "default._bimi.example.com",
            vec!["v=BIMI1; l=http://example.com/logo.svg"],
        );

        let verdict = resolve(
            &resolver,
            &plain_message(),
            "example.com",
            &dmarc(DmarcStatus::Pass, "reject", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::PermError);
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let resolver = MockResolver::new();
        let verdict = resolve(
            &resolver,
            &plain_message(),
            "example.com",
            &dmarc(DmarcStatus::Pass, "reject", "example.com"),
        )
        .await;
        assert_eq!(verdict.status, BimiStatus::None);
    }
}
