//! The SPF `check_host` state machine (RFC 7208 §4–§5).
//!
//! All DNS goes through [`MeteredDns`], so one shared counter bounds
//! the whole evaluation — includes, redirects, and the A lookups under
//! `mx` alike. The first matching mechanism wins.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver, LookupCounter, MeteredDns};
use crate::common::domain;

use super::macro_exp::{expand, MacroContext};
use super::record::{Qualifier, SpfRecord, SpfTerm};
use super::{SpfResult, SpfVerdict};

/// Default hard limit on DNS queries per evaluation.
pub const DEFAULT_MAX_LOOKUPS: usize = 50;
/// MX targets examined per `mx` mechanism.
const MAX_MX_TARGETS: usize = 10;

/// SPF evaluator over an injected resolver.
pub struct SpfVerifier<'a, R: DnsResolver> {
    resolver: &'a R,
    max_lookups: usize,
    receiver: String,
}

impl<'a, R: DnsResolver> SpfVerifier<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self {
            resolver,
            max_lookups: DEFAULT_MAX_LOOKUPS,
            receiver: "localhost".into(),
        }
    }

    pub fn max_lookups(mut self, limit: usize) -> Self {
        self.max_lookups = limit;
        self
    }

    /// Receiving MTA hostname, used by the `%{r}` macro.
    pub fn receiver(mut self, hostname: impl Into<String>) -> Self {
        self.receiver = hostname.into();
        self
    }

    /// RFC 7208 `check_host()` for an SMTP transaction.
    ///
    /// An empty `mail_from` falls back to `postmaster@<helo>`; a
    /// `mail_from` without a local part gets `postmaster` prepended.
    /// IPv6-mapped IPv4 client addresses are unwrapped first.
    pub async fn evaluate(&self, client_ip: IpAddr, helo: &str, mail_from: &str) -> SpfVerdict {
        let client_ip = unmap_ip(client_ip);

        let sender = if mail_from.is_empty() {
            format!("postmaster@{helo}")
        } else if mail_from.contains('@') {
            mail_from.to_string()
        } else {
            format!("postmaster@{mail_from}")
        };
        let sender_domain = domain::domain_from_email(&sender)
            .unwrap_or(helo)
            .to_string();

        let counter = LookupCounter::new(self.max_lookups);
        let dns = MeteredDns::new(self.resolver, &counter);

        let outcome = self
            .check_host(&dns, client_ip, helo, &sender, &sender_domain)
            .await;

        // exp= is informational and resolved outside the budget.
        let explanation = match (outcome.result, &outcome.exp_domain) {
            (SpfResult::Fail, Some(exp)) => {
                self.fetch_explanation(client_ip, helo, &sender, &outcome.domain, exp)
                    .await
            }
            _ => None,
        }
        .or(outcome.detail);

        debug!(
            result = %outcome.result,
            domain = %outcome.domain,
            lookups = counter.used(),
            "spf evaluation finished"
        );

        SpfVerdict {
            result: outcome.result,
            domain: outcome.domain,
            sender,
            client_ip,
            helo: helo.to_string(),
            mechanism: outcome.mechanism,
            explanation,
            record: outcome.record,
            lookups: counter.used(),
        }
    }

    async fn check_host(
        &self,
        dns: &MeteredDns<'_, R>,
        client_ip: IpAddr,
        helo: &str,
        sender: &str,
        domain: &str,
    ) -> CheckOutcome {
        let records = match dns.txt(domain).await {
            Ok(records) => records,
            Err(e) => return CheckOutcome::from_dns_error(domain, e),
        };

        let mut spf_records = records.iter().filter(|r| SpfRecord::is_spf(r));
        let Some(record_txt) = spf_records.next() else {
            return CheckOutcome::bare(domain, SpfResult::None);
        };
        if spf_records.next().is_some() {
            return CheckOutcome::error(
                domain,
                SpfResult::PermError,
                "multiple v=spf1 records published",
            );
        }

        let record = match SpfRecord::parse(record_txt) {
            Ok(record) => record,
            Err(e) => return CheckOutcome::error(domain, SpfResult::PermError, &e.to_string()),
        };

        let macro_ctx = MacroContext {
            sender,
            local_part: domain::local_part_from_email(sender),
            sender_domain: domain::domain_from_email(sender).unwrap_or(domain),
            domain,
            client_ip,
            helo,
            receiver: &self.receiver,
        };

        for term in &record.terms {
            let matched = match self
                .evaluate_term(dns, term, &macro_ctx, client_ip, helo, sender, domain)
                .await
            {
                TermOutcome::Match => true,
                TermOutcome::NoMatch => false,
                TermOutcome::Error(result, detail) => {
                    return CheckOutcome::error(domain, result, &detail)
                        .with_record(&record)
                }
            };

            if matched {
                return CheckOutcome {
                    result: term.qualifier().result(),
                    domain: domain.to_string(),
                    mechanism: Some(term.label()),
                    record: Some(record.raw.clone()),
                    detail: None,
                    exp_domain: record.exp.clone(),
                };
            }
        }

        // redirect= applies only when nothing matched and the record
        // carries no all mechanism.
        if let (Some(target), false) = (&record.redirect, record.has_all()) {
            let target = match expand(target, &macro_ctx, false) {
                Ok(t) => t,
                Err(e) => {
                    return CheckOutcome::error(domain, SpfResult::PermError, &e)
                        .with_record(&record)
                }
            };
            let outcome =
                Box::pin(self.check_host(dns, client_ip, helo, sender, &target)).await;
            // A missing record at the redirect target is a permerror.
            if outcome.result == SpfResult::None {
                return CheckOutcome::error(
                    &target,
                    SpfResult::PermError,
                    "redirect target has no SPF record",
                );
            }
            return outcome;
        }

        CheckOutcome::bare(domain, SpfResult::Neutral).with_record(&record)
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_term(
        &self,
        dns: &MeteredDns<'_, R>,
        term: &SpfTerm,
        macro_ctx: &MacroContext<'_>,
        client_ip: IpAddr,
        helo: &str,
        sender: &str,
        domain: &str,
    ) -> TermOutcome {
        match term {
            SpfTerm::All(_) => TermOutcome::Match,

            SpfTerm::Include(_, target) => {
                let target = match expand(target, macro_ctx, false) {
                    Ok(t) => t,
                    Err(e) => return TermOutcome::Error(SpfResult::PermError, e),
                };
                let child =
                    Box::pin(self.check_host(dns, client_ip, helo, sender, &target)).await;
                match child.result {
                    SpfResult::Pass => TermOutcome::Match,
                    SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => {
                        TermOutcome::NoMatch
                    }
                    // No record inside include is a permanent error at
                    // the parent.
                    SpfResult::None => TermOutcome::Error(
                        SpfResult::PermError,
                        format!("include target {target} has no SPF record"),
                    ),
                    SpfResult::PermError => TermOutcome::Error(
                        SpfResult::PermError,
                        child
                            .detail
                            .unwrap_or_else(|| format!("include {target} permerror")),
                    ),
                    SpfResult::TempError => TermOutcome::Error(
                        SpfResult::TempError,
                        child
                            .detail
                            .unwrap_or_else(|| format!("include {target} temperror")),
                    ),
                }
            }

            SpfTerm::A {
                domain: spec,
                cidr4,
                cidr6,
                ..
            } => {
                let target = match expand_target(spec, macro_ctx, domain) {
                    Ok(t) => t,
                    Err(e) => return TermOutcome::Error(SpfResult::PermError, e),
                };
                self.match_a(dns, &target, client_ip, *cidr4, *cidr6).await
            }

            SpfTerm::Mx {
                domain: spec,
                cidr4,
                cidr6,
                ..
            } => {
                let target = match expand_target(spec, macro_ctx, domain) {
                    Ok(t) => t,
                    Err(e) => return TermOutcome::Error(SpfResult::PermError, e),
                };
                let mut hosts = match dns.mx(&target).await {
                    Ok(hosts) => hosts,
                    Err(e) => return TermOutcome::from_dns_error(e),
                };
                hosts.sort_by_key(|mx| mx.priority);

                for mx in hosts.into_iter().take(MAX_MX_TARGETS) {
                    match self
                        .match_a(dns, &mx.exchange, client_ip, *cidr4, *cidr6)
                        .await
                    {
                        TermOutcome::Match => return TermOutcome::Match,
                        TermOutcome::NoMatch => continue,
                        other => return other,
                    }
                }
                TermOutcome::NoMatch
            }

            // PTR is out of scope; it spends budget and never matches.
            SpfTerm::Ptr(_, _) => match dns.counter().charge() {
                Ok(()) => TermOutcome::NoMatch,
                Err(e) => TermOutcome::from_dns_error(e),
            },

            SpfTerm::Ip4(_, network, prefix) => match client_ip {
                IpAddr::V4(client) if ip4_in_network(client, *network, *prefix) => {
                    TermOutcome::Match
                }
                _ => TermOutcome::NoMatch,
            },

            SpfTerm::Ip6(_, network, prefix) => match client_ip {
                IpAddr::V6(client) if ip6_in_network(client, *network, *prefix) => {
                    TermOutcome::Match
                }
                _ => TermOutcome::NoMatch,
            },

            SpfTerm::Exists(_, target) => {
                let target = match expand(target, macro_ctx, false) {
                    Ok(t) => t,
                    Err(e) => return TermOutcome::Error(SpfResult::PermError, e),
                };
                // exists: always queries A, even for IPv6 clients.
                match dns.a(&target).await {
                    Ok(addrs) if !addrs.is_empty() => TermOutcome::Match,
                    Ok(_) => TermOutcome::NoMatch,
                    Err(e) => TermOutcome::from_dns_error(e),
                }
            }
        }
    }

    async fn match_a(
        &self,
        dns: &MeteredDns<'_, R>,
        target: &str,
        client_ip: IpAddr,
        cidr4: u8,
        cidr6: u8,
    ) -> TermOutcome {
        match client_ip {
            IpAddr::V4(client) => match dns.a(target).await {
                Ok(addrs) => {
                    if addrs.iter().any(|a| ip4_in_network(client, *a, cidr4)) {
                        TermOutcome::Match
                    } else {
                        TermOutcome::NoMatch
                    }
                }
                Err(e) => TermOutcome::from_dns_error(e),
            },
            IpAddr::V6(client) => match dns.aaaa(target).await {
                Ok(addrs) => {
                    if addrs.iter().any(|a| ip6_in_network(client, *a, cidr6)) {
                        TermOutcome::Match
                    } else {
                        TermOutcome::NoMatch
                    }
                }
                Err(e) => TermOutcome::from_dns_error(e),
            },
        }
    }

    /// Resolve and expand `exp=` text. Failures just drop the
    /// explanation; they never affect the verdict.
    async fn fetch_explanation(
        &self,
        client_ip: IpAddr,
        helo: &str,
        sender: &str,
        domain: &str,
        exp_domain: &str,
    ) -> Option<String> {
        let macro_ctx = MacroContext {
            sender,
            local_part: domain::local_part_from_email(sender),
            sender_domain: domain::domain_from_email(sender).unwrap_or(domain),
            domain,
            client_ip,
            helo,
            receiver: &self.receiver,
        };
        let target = expand(exp_domain, &macro_ctx, false).ok()?;
        let ascii = domain::to_ascii(&target).ok()?;

        let records = self.resolver.query_txt(&ascii).await.ok()?;
        let text = records.first()?;
        expand(text, &macro_ctx, true).ok()
    }
}

// ---------------------------------------------------------------------------
// Outcome plumbing
// ---------------------------------------------------------------------------

struct CheckOutcome {
    result: SpfResult,
    domain: String,
    mechanism: Option<String>,
    record: Option<String>,
    detail: Option<String>,
    exp_domain: Option<String>,
}

impl CheckOutcome {
    fn bare(domain: &str, result: SpfResult) -> Self {
        CheckOutcome {
            result,
            domain: domain.to_string(),
            mechanism: None,
            record: None,
            detail: None,
            exp_domain: None,
        }
    }

    fn error(domain: &str, result: SpfResult, detail: &str) -> Self {
        CheckOutcome {
            detail: Some(detail.to_string()),
            ..CheckOutcome::bare(domain, result)
        }
    }

    fn from_dns_error(domain: &str, error: DnsError) -> Self {
        match error {
            DnsError::TempFail(e) => CheckOutcome::error(domain, SpfResult::TempError, &e),
            DnsError::PermFail(e) => CheckOutcome::error(domain, SpfResult::PermError, &e),
            DnsError::NotFound => CheckOutcome::bare(domain, SpfResult::None),
        }
    }

    fn with_record(mut self, record: &SpfRecord) -> Self {
        self.record.get_or_insert_with(|| record.raw.clone());
        if self.exp_domain.is_none() {
            self.exp_domain.clone_from(&record.exp);
        }
        self
    }
}

enum TermOutcome {
    Match,
    NoMatch,
    Error(SpfResult, String),
}

impl TermOutcome {
    fn from_dns_error(error: DnsError) -> Self {
        match error {
            DnsError::TempFail(e) => TermOutcome::Error(SpfResult::TempError, e),
            DnsError::PermFail(e) => TermOutcome::Error(SpfResult::PermError, e),
            // The metered layer returns empty lists for NXDOMAIN, so
            // this only appears from raw resolver passthrough.
            DnsError::NotFound => TermOutcome::NoMatch,
        }
    }
}

fn expand_target(
    spec: &Option<String>,
    macro_ctx: &MacroContext<'_>,
    current: &str,
) -> Result<String, String> {
    match spec {
        Some(spec) => expand(spec, macro_ctx, false),
        None => Ok(current.to_string()),
    }
}

/// Strip the IPv6-mapped wrapper: `::ffff:a.b.c.d` matches as IPv4.
fn unmap_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = !0u32 << (32 - prefix);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

fn ip6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 128 {
        return false;
    }
    let mask = !0u128 << (128 - prefix);
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}
