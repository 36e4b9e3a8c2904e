//! SPF record parsing (RFC 7208 §4.6, §5).
//!
//! Mechanism names are case-insensitive; domain-specs keep their case
//! because macro letters are case-sensitive (`%{S}` URL-encodes,
//! `%{s}` does not).

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::AuthError;

use super::SpfResult;

/// Mechanism qualifier. Defaults to `+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qualifier {
    #[default]
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '+' => Some(Qualifier::Pass),
            '-' => Some(Qualifier::Fail),
            '~' => Some(Qualifier::SoftFail),
            '?' => Some(Qualifier::Neutral),
            _ => None,
        }
    }

    pub fn result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Qualifier::Pass => "",
            Qualifier::Fail => "-",
            Qualifier::SoftFail => "~",
            Qualifier::Neutral => "?",
        }
    }
}

/// One directive of an SPF record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpfTerm {
    All(Qualifier),
    Include(Qualifier, String),
    A {
        qualifier: Qualifier,
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    Mx {
        qualifier: Qualifier,
        domain: Option<String>,
        cidr4: u8,
        cidr6: u8,
    },
    /// Parsed for budget accounting but never matched; PTR validation
    /// is deliberately unsupported.
    Ptr(Qualifier, Option<String>),
    Ip4(Qualifier, Ipv4Addr, u8),
    Ip6(Qualifier, Ipv6Addr, u8),
    Exists(Qualifier, String),
}

impl SpfTerm {
    pub fn qualifier(&self) -> Qualifier {
        match self {
            SpfTerm::All(q)
            | SpfTerm::Include(q, _)
            | SpfTerm::A { qualifier: q, .. }
            | SpfTerm::Mx { qualifier: q, .. }
            | SpfTerm::Ptr(q, _)
            | SpfTerm::Ip4(q, _, _)
            | SpfTerm::Ip6(q, _, _)
            | SpfTerm::Exists(q, _) => *q,
        }
    }

    /// Wire-format name with qualifier, for verdict reporting.
    pub fn label(&self) -> String {
        let (q, name) = match self {
            SpfTerm::All(q) => (q, "all".to_string()),
            SpfTerm::Include(q, d) => (q, format!("include:{d}")),
            SpfTerm::A { qualifier, .. } => (qualifier, "a".to_string()),
            SpfTerm::Mx { qualifier, .. } => (qualifier, "mx".to_string()),
            SpfTerm::Ptr(q, _) => (q, "ptr".to_string()),
            SpfTerm::Ip4(q, addr, prefix) => (q, format!("ip4:{addr}/{prefix}")),
            SpfTerm::Ip6(q, addr, prefix) => (q, format!("ip6:{addr}/{prefix}")),
            SpfTerm::Exists(q, d) => (q, format!("exists:{d}")),
        };
        format!("{}{}", q.prefix(), name)
    }
}

/// A parsed SPF record.
#[derive(Debug, Clone)]
pub struct SpfRecord {
    pub terms: Vec<SpfTerm>,
    pub redirect: Option<String>,
    pub exp: Option<String>,
    pub raw: String,
}

impl SpfRecord {
    /// Is this TXT string an SPF version 1 record?
    pub fn is_spf(txt: &str) -> bool {
        let t = txt.trim_start();
        let Some(rest) = strip_prefix_ci(t, "v=spf1") else {
            return false;
        };
        rest.is_empty() || rest.starts_with(' ') || rest.starts_with('\t')
    }

    pub fn has_all(&self) -> bool {
        self.terms.iter().any(|t| matches!(t, SpfTerm::All(_)))
    }

    pub fn parse(txt: &str) -> Result<Self, AuthError> {
        let trimmed = txt.trim();
        let rest = strip_prefix_ci(trimmed, "v=spf1")
            .ok_or_else(|| AuthError::DnsPermError("record is not v=spf1".into()))?;

        let mut terms = Vec::new();
        let mut redirect = None;
        let mut exp = None;

        for token in rest.split_whitespace() {
            // Modifiers: name=value, name case-insensitive.
            if let Some((name, value)) = token.split_once('=') {
                if !name.contains(':') && !name.contains('/') {
                    match name.to_ascii_lowercase().as_str() {
                        "redirect" => {
                            if redirect.replace(value.to_string()).is_some() {
                                return Err(perm("duplicate redirect modifier"));
                            }
                        }
                        "exp" => {
                            if exp.replace(value.to_string()).is_some() {
                                return Err(perm("duplicate exp modifier"));
                            }
                        }
                        // Unknown modifiers are ignored for forward
                        // compatibility.
                        _ => {}
                    }
                    continue;
                }
            }

            terms.push(parse_term(token)?);
        }

        Ok(SpfRecord {
            terms,
            redirect,
            exp,
            raw: trimmed.to_string(),
        })
    }
}

fn perm(msg: &str) -> AuthError {
    AuthError::DnsPermError(msg.to_string())
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn parse_term(token: &str) -> Result<SpfTerm, AuthError> {
    let mut rest = token;
    let qualifier = match rest.chars().next().and_then(Qualifier::from_char) {
        Some(q) => {
            rest = &rest[1..];
            q
        }
        None => Qualifier::default(),
    };
    if rest.is_empty() {
        return Err(perm("empty directive"));
    }

    // Split mechanism name from its argument (`:domain` or `/cidr`).
    let (name, arg) = match rest.find([':', '/']) {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };

    match name.to_ascii_lowercase().as_str() {
        "all" if arg.is_empty() => Ok(SpfTerm::All(qualifier)),
        "include" => Ok(SpfTerm::Include(
            qualifier,
            required_domain(arg, "include")?,
        )),
        "exists" => Ok(SpfTerm::Exists(qualifier, required_domain(arg, "exists")?)),
        "ptr" => Ok(SpfTerm::Ptr(
            qualifier,
            arg.strip_prefix(':').map(String::from),
        )),
        "a" => {
            let (domain, cidr4, cidr6) = parse_domain_cidr(arg)?;
            Ok(SpfTerm::A {
                qualifier,
                domain,
                cidr4,
                cidr6,
            })
        }
        "mx" => {
            let (domain, cidr4, cidr6) = parse_domain_cidr(arg)?;
            Ok(SpfTerm::Mx {
                qualifier,
                domain,
                cidr4,
                cidr6,
            })
        }
        "ip4" => {
            let spec = arg
                .strip_prefix(':')
                .ok_or_else(|| perm("ip4 requires an address"))?;
            let (addr, prefix) = split_cidr(spec, 32)?;
            let addr: Ipv4Addr = addr
                .parse()
                .map_err(|_| perm(&format!("invalid ip4 address: {addr}")))?;
            if prefix > 32 {
                return Err(perm(&format!("invalid ip4 prefix: {prefix}")));
            }
            Ok(SpfTerm::Ip4(qualifier, addr, prefix))
        }
        "ip6" => {
            let spec = arg
                .strip_prefix(':')
                .ok_or_else(|| perm("ip6 requires an address"))?;
            let (addr, prefix) = split_cidr(spec, 128)?;
            let addr: Ipv6Addr = addr
                .parse()
                .map_err(|_| perm(&format!("invalid ip6 address: {addr}")))?;
            if prefix > 128 {
                return Err(perm(&format!("invalid ip6 prefix: {prefix}")));
            }
            Ok(SpfTerm::Ip6(qualifier, addr, prefix))
        }
        other => Err(perm(&format!("unknown mechanism: {other}"))),
    }
}

fn required_domain(arg: &str, mechanism: &str) -> Result<String, AuthError> {
    match arg.strip_prefix(':') {
        Some(domain) if !domain.is_empty() => Ok(domain.to_string()),
        _ => Err(perm(&format!("{mechanism} requires a domain"))),
    }
}

/// `[:domain][/cidr4][//cidr6]` for the `a` and `mx` mechanisms.
fn parse_domain_cidr(arg: &str) -> Result<(Option<String>, u8, u8), AuthError> {
    let mut domain = None;
    let mut rest = arg;

    if let Some(after_colon) = rest.strip_prefix(':') {
        match after_colon.find('/') {
            Some(pos) => {
                domain = Some(after_colon[..pos].to_string());
                rest = &after_colon[pos..];
            }
            None => {
                domain = Some(after_colon.to_string());
                rest = "";
            }
        }
        if domain.as_deref().is_some_and(str::is_empty) {
            return Err(perm("empty domain-spec"));
        }
    }

    let mut cidr4 = 32u8;
    let mut cidr6 = 128u8;
    if let Some(cidrs) = rest.strip_prefix('/') {
        if let Some(v6) = cidrs.strip_prefix('/') {
            cidr6 = parse_prefix(v6, 128)?;
        } else if let Some(pos) = cidrs.find("//") {
            cidr4 = parse_prefix(&cidrs[..pos], 32)?;
            cidr6 = parse_prefix(&cidrs[pos + 2..], 128)?;
        } else {
            cidr4 = parse_prefix(cidrs, 32)?;
        }
    } else if !rest.is_empty() {
        return Err(perm(&format!("trailing junk in mechanism: {rest}")));
    }

    Ok((domain, cidr4, cidr6))
}

fn parse_prefix(s: &str, max: u8) -> Result<u8, AuthError> {
    let value: u8 = s
        .parse()
        .map_err(|_| perm(&format!("invalid CIDR prefix: {s}")))?;
    if value > max {
        return Err(perm(&format!("CIDR prefix out of range: {value}")));
    }
    Ok(value)
}

fn split_cidr(spec: &str, default: u8) -> Result<(&str, u8), AuthError> {
    match spec.split_once('/') {
        Some((addr, prefix)) => Ok((addr, parse_prefix(prefix, default)?)),
        None => Ok((spec, default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_record() {
        let record = SpfRecord::parse("v=spf1 -all").unwrap();
        assert_eq!(record.terms, vec![SpfTerm::All(Qualifier::Fail)]);
        assert!(record.has_all());
    }

    #[test]
    fn is_spf_requires_exact_version_token() {
        assert!(SpfRecord::is_spf("v=spf1 -all"));
        assert!(SpfRecord::is_spf("V=SPF1 mx"));
        assert!(SpfRecord::is_spf("v=spf1"));
        assert!(!SpfRecord::is_spf("v=spf10 -all"));
        assert!(!SpfRecord::is_spf("spf1 -all"));
    }

    #[test]
    fn ip4_with_prefix() {
        let record = SpfRecord::parse("v=spf1 ip4:192.0.2.0/24 -all").unwrap();
        assert_eq!(
            record.terms[0],
            SpfTerm::Ip4(Qualifier::Pass, "192.0.2.0".parse().unwrap(), 24)
        );
    }

    #[test]
    fn ip4_default_prefix_32() {
        let record = SpfRecord::parse("v=spf1 ip4:192.0.2.1 -all").unwrap();
        assert_eq!(
            record.terms[0],
            SpfTerm::Ip4(Qualifier::Pass, "192.0.2.1".parse().unwrap(), 32)
        );
    }

    #[test]
    fn ip6_default_prefix_128() {
        let record = SpfRecord::parse("v=spf1 ip6:2001:db8::1").unwrap();
        assert_eq!(
            record.terms[0],
            SpfTerm::Ip6(Qualifier::Pass, "2001:db8::1".parse().unwrap(), 128)
        );
    }

    #[test]
    fn a_mx_cidr_forms() {
        let record =
            SpfRecord::parse("v=spf1 a mx/24 a:mail.example.com/24//64 mx:other.example//48")
                .unwrap();
        assert_eq!(
            record.terms[0],
            SpfTerm::A {
                qualifier: Qualifier::Pass,
                domain: None,
                cidr4: 32,
                cidr6: 128
            }
        );
        assert_eq!(
            record.terms[1],
            SpfTerm::Mx {
                qualifier: Qualifier::Pass,
                domain: None,
                cidr4: 24,
                cidr6: 128
            }
        );
        assert_eq!(
            record.terms[2],
            SpfTerm::A {
                qualifier: Qualifier::Pass,
                domain: Some("mail.example.com".into()),
                cidr4: 24,
                cidr6: 64
            }
        );
        assert_eq!(
            record.terms[3],
            SpfTerm::Mx {
                qualifier: Qualifier::Pass,
                domain: Some("other.example".into()),
                cidr4: 32,
                cidr6: 48
            }
        );
    }

    #[test]
    fn include_and_redirect() {
        let record =
            SpfRecord::parse("v=spf1 include:_spf.example.com redirect=_spf.backup.example")
                .unwrap();
        assert_eq!(
            record.terms[0],
            SpfTerm::Include(Qualifier::Pass, "_spf.example.com".into())
        );
        assert_eq!(record.redirect.as_deref(), Some("_spf.backup.example"));
    }

    #[test]
    fn duplicate_redirect_rejected() {
        assert!(SpfRecord::parse("v=spf1 redirect=a.com redirect=b.com").is_err());
    }

    #[test]
    fn macro_case_preserved_in_domain_spec() {
        let record = SpfRecord::parse("v=spf1 exists:%{Ir}.%{L}._spf.example.com -all").unwrap();
        assert_eq!(
            record.terms[0],
            SpfTerm::Exists(Qualifier::Pass, "%{Ir}.%{L}._spf.example.com".into())
        );
    }

    #[test]
    fn unknown_modifier_ignored() {
        let record = SpfRecord::parse("v=spf1 unknown=value -all").unwrap();
        assert_eq!(record.terms.len(), 1);
    }

    #[test]
    fn unknown_mechanism_rejected() {
        assert!(SpfRecord::parse("v=spf1 bogus -all").is_err());
    }

    #[test]
    fn qualifiers_parsed() {
        let record = SpfRecord::parse("v=spf1 ~include:a.com ?mx -all").unwrap();
        assert_eq!(record.terms[0].qualifier(), Qualifier::SoftFail);
        assert_eq!(record.terms[1].qualifier(), Qualifier::Neutral);
        assert_eq!(record.terms[2].qualifier(), Qualifier::Fail);
    }

    #[test]
    fn labels_for_reporting() {
        let record = SpfRecord::parse("v=spf1 mx -all").unwrap();
        assert_eq!(record.terms[0].label(), "mx");
        assert_eq!(record.terms[1].label(), "-all");
    }

    #[test]
    fn invalid_cidr_rejected() {
        assert!(SpfRecord::parse("v=spf1 ip4:192.0.2.0/33").is_err());
        assert!(SpfRecord::parse("v=spf1 a/99").is_err());
    }
}
