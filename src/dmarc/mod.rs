//! DMARC policy resolution and alignment (RFC 7489).

pub mod alignment;
pub mod record;

pub use record::{AlignmentMode, DmarcRecord, Policy};

use std::fmt;

use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver};
use crate::common::domain;
use crate::dkim::DkimVerdict;
use crate::spf::SpfVerdict;

/// DMARC evaluation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcStatus {
    Pass,
    Fail,
    /// No policy published.
    None,
}

impl fmt::Display for DmarcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DmarcStatus::Pass => "pass",
            DmarcStatus::Fail => "fail",
            DmarcStatus::None => "none",
        })
    }
}

/// Which mechanism satisfied alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignedMethod {
    Dkim,
    Spf,
}

/// DMARC outcome: status plus the published policy details.
#[derive(Debug, Clone)]
pub struct DmarcVerdict {
    pub status: DmarcStatus,
    /// RFC5322.From domain the evaluation applied to.
    pub domain: String,
    /// Method that passed aligned, when status is pass.
    pub aligned: Option<AlignedMethod>,
    pub record: Option<DmarcRecord>,
    /// Domain where the policy record was found (the From domain or
    /// its organizational domain).
    pub record_domain: Option<String>,
}

impl DmarcVerdict {
    pub fn is_pass(&self) -> bool {
        self.status == DmarcStatus::Pass
    }

    fn none(domain: &str) -> Self {
        DmarcVerdict {
            status: DmarcStatus::None,
            domain: domain.to_string(),
            aligned: None,
            record: None,
            record_domain: None,
        }
    }

    /// The policy that applies to this message: `sp=` for subdomain
    /// mail when present, `p=` otherwise.
    pub fn effective_policy(&self) -> Option<Policy> {
        let record = self.record.as_ref()?;
        let record_domain = self.record_domain.as_deref()?;
        if !domain::domains_equal(&self.domain, record_domain) {
            if let Some(sp) = record.subdomain_policy {
                return Some(sp);
            }
        }
        Some(record.policy)
    }
}

/// DMARC evaluator over an injected resolver.
pub struct DmarcVerifier<'a, R: DnsResolver> {
    resolver: &'a R,
}

impl<'a, R: DnsResolver> DmarcVerifier<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Evaluate DMARC for the given From domain against SPF and DKIM
    /// results. Unresolvable policies fail open as `none`.
    pub async fn verify(
        &self,
        from_domain: &str,
        spf: Option<&SpfVerdict>,
        dkim: &[DkimVerdict],
    ) -> DmarcVerdict {
        let Some((record, record_domain)) = self.lookup_policy(from_domain).await else {
            return DmarcVerdict::none(from_domain);
        };

        let dkim_aligned = dkim.iter().any(|v| {
            v.is_pass() && alignment::aligned(&v.domain, from_domain, record.adkim)
        });
        let spf_aligned = spf.is_some_and(|v| {
            v.is_pass()
                && domain::domain_from_email(&v.sender)
                    .map(|d| alignment::aligned(d, from_domain, record.aspf))
                    .unwrap_or(false)
        });

        let (status, aligned) = if dkim_aligned {
            (DmarcStatus::Pass, Some(AlignedMethod::Dkim))
        } else if spf_aligned {
            (DmarcStatus::Pass, Some(AlignedMethod::Spf))
        } else {
            (DmarcStatus::Fail, None)
        };

        debug!(%status, domain = from_domain, "dmarc evaluated");
        DmarcVerdict {
            status,
            domain: from_domain.to_string(),
            aligned,
            record: Some(record),
            record_domain: Some(record_domain),
        }
    }

    /// `_dmarc.<from>`, then the organizational domain.
    async fn lookup_policy(&self, from_domain: &str) -> Option<(DmarcRecord, String)> {
        if let Some(record) = self.query_policy(from_domain).await {
            return Some((record, from_domain.to_string()));
        }
        let org = domain::organizational_domain(from_domain);
        if !domain::domains_equal(&org, from_domain) {
            if let Some(record) = self.query_policy(&org).await {
                return Some((record, org));
            }
        }
        None
    }

    async fn query_policy(&self, domain: &str) -> Option<DmarcRecord> {
        let ascii = domain::to_ascii(domain).ok()?;
        let name = format!("_dmarc.{ascii}");
        let records = match self.resolver.query_txt(&name).await {
            Ok(records) => records,
            Err(DnsError::NotFound) => return None,
            // Fail open: a transient DNS problem must not turn into a
            // fabricated policy.
            Err(_) => return None,
        };
        records
            .iter()
            .filter(|r| DmarcRecord::is_dmarc(r))
            .find_map(|r| DmarcRecord::parse(r).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;
    use crate::dkim::{Algorithm, DkimStatus};
    use std::net::IpAddr;

    fn dkim_pass(domain: &str) -> DkimVerdict {
        DkimVerdict {
            status: DkimStatus::Pass,
            domain: domain.to_string(),
            selector: "sel".into(),
            auid: format!("@{domain}"),
            algorithm: Some(Algorithm::Ed25519Sha256),
            signature_prefix: "AAAAAAAA".into(),
            detail: None,
            policy: None,
            testing: false,
        }
    }

    fn spf_verdict(result: crate::spf::SpfResult, sender: &str) -> SpfVerdict {
        SpfVerdict {
            result,
            domain: crate::common::domain::domain_from_email(sender)
                .unwrap_or("")
                .to_string(),
            sender: sender.to_string(),
            client_ip: IpAddr::from([192, 0, 2, 1]),
            helo: "helo.example".into(),
            mechanism: None,
            explanation: None,
            record: None,
            lookups: 0,
        }
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let resolver = MockResolver::new();
        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", None, &[])
            .await;
        assert_eq!(verdict.status, DmarcStatus::None);
        assert!(verdict.record.is_none());
    }

    #[tokio::test]
    async fn passes_via_aligned_dkim() {
        let resolver = MockResolver::new();
        resolver.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject"]);

        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", None, &[dkim_pass("mail.example.com")])
            .await;
        assert_eq!(verdict.status, DmarcStatus::Pass);
        assert_eq!(verdict.aligned, Some(AlignedMethod::Dkim));
    }

    #[tokio::test]
    async fn passes_via_aligned_spf() {
        let resolver = MockResolver::new();
        resolver.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject"]);

        let spf = spf_verdict(crate::spf::SpfResult::Pass, "bounce@example.com");
        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", Some(&spf), &[])
            .await;
        assert_eq!(verdict.status, DmarcStatus::Pass);
        assert_eq!(verdict.aligned, Some(AlignedMethod::Spf));
    }

    #[tokio::test]
    async fn spf_pass_without_alignment_fails() {
        let resolver = MockResolver::new();
        resolver.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject"]);

        let spf = spf_verdict(crate::spf::SpfResult::Pass, "bounce@other.org");
        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", Some(&spf), &[])
            .await;
        assert_eq!(verdict.status, DmarcStatus::Fail);
    }

    #[tokio::test]
    async fn strict_adkim_rejects_subdomain() {
        let resolver = MockResolver::new();
        resolver.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject; adkim=s"]);

        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", None, &[dkim_pass("mail.example.com")])
            .await;
        assert_eq!(verdict.status, DmarcStatus::Fail);
    }

    #[tokio::test]
    async fn org_domain_fallback() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "_dmarc.example.com",
            vec!["v=DMARC1; p=reject; sp=quarantine"],
        );

        let verdict = DmarcVerifier::new(&resolver)
            .verify("mail.example.com", None, &[])
            .await;
        assert_eq!(verdict.status, DmarcStatus::Fail);
        assert_eq!(verdict.record_domain.as_deref(), Some("example.com"));
        assert_eq!(verdict.effective_policy(), Some(Policy::Quarantine));
    }

    #[tokio::test]
    async fn effective_policy_without_sp_uses_p() {
        let resolver = MockResolver::new();
        resolver.add_txt("_dmarc.example.com", vec!["v=DMARC1; p=reject"]);

        let verdict = DmarcVerifier::new(&resolver)
            .verify("mail.example.com", None, &[])
            .await;
        assert_eq!(verdict.effective_policy(), Some(Policy::Reject));
    }

    #[tokio::test]
    async fn dns_failure_fails_open() {
        let resolver = MockResolver::new();
        resolver.fail("_dmarc.example.com", DnsError::TempFail("timeout".into()));

        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", None, &[dkim_pass("example.com")])
            .await;
        assert_eq!(verdict.status, DmarcStatus::None);
    }

    #[tokio::test]
    async fn non_dmarc_txt_ignored() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "_dmarc.example.com",
            vec!["some verification token", "v=DMARC1; p=none"],
        );

        let verdict = DmarcVerifier::new(&resolver)
            .verify("example.com", None, &[dkim_pass("example.com")])
            .await;
        assert_eq!(verdict.status, DmarcStatus::Pass);
        assert_eq!(verdict.record.unwrap().policy, Policy::None);
    }
}
