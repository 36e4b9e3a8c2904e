//! Wire-format result headers: `Authentication-Results` and
//! `Received-SPF`.

use crate::arc::{ArcStatus, ArcVerdict};
use crate::bimi::BimiVerdict;
use crate::dkim::{DkimStatus, DkimVerdict};
use crate::dmarc::DmarcVerdict;
use crate::spf::SpfVerdict;

/// `Received-SPF` lines fold at this width.
const RECEIVED_SPF_WIDTH: usize = 160;
/// `Authentication-Results` property groups fold at this width.
const AUTH_RESULTS_WIDTH: usize = 78;

/// Builder for an `Authentication-Results` header (RFC 8601). The same
/// method sections feed ARC-Authentication-Results payloads.
#[derive(Debug, Clone)]
pub struct AuthResults {
    mta: String,
    sections: Vec<String>,
}

impl AuthResults {
    pub fn new(mta: impl Into<String>) -> Self {
        Self {
            mta: mta.into(),
            sections: Vec::new(),
        }
    }

    pub fn add_dkim(&mut self, verdict: &DkimVerdict) {
        if verdict.status == DkimStatus::None {
            self.sections.push("dkim=none".into());
            return;
        }
        let mut section = format!("dkim={}", verdict.status);
        if let Some(ref detail) = verdict.detail {
            section.push_str(&format!(" ({})", comment(detail)));
        }
        if !verdict.auid.is_empty() {
            section.push_str(&format!(" header.i={}", verdict.auid));
        }
        if !verdict.selector.is_empty() {
            section.push_str(&format!(" header.s={}", verdict.selector));
        }
        if let Some(algorithm) = verdict.algorithm {
            section.push_str(&format!(" header.a={algorithm}"));
        }
        if !verdict.signature_prefix.is_empty() {
            section.push_str(&format!(" header.b=\"{}\"", verdict.signature_prefix));
        }
        if let Some(policy) = verdict.policy {
            section.push_str(&format!(" policy.dkim-rules={policy}"));
        }
        self.sections.push(section);
    }

    pub fn add_spf(&mut self, verdict: &SpfVerdict) {
        let comment_text = verdict.explanation.clone().unwrap_or_else(|| {
            let relation = match verdict.result {
                crate::spf::SpfResult::Pass => "designates",
                _ => "does not designate",
            };
            format!(
                "{}: domain of {} {relation} {} as permitted sender",
                self.mta, verdict.sender, verdict.client_ip
            )
        });
        self.sections.push(format!(
            "spf={} ({}) smtp.mailfrom={} smtp.helo={}",
            verdict.result,
            comment(&comment_text),
            verdict.sender,
            verdict.helo
        ));
    }

    pub fn add_dmarc(&mut self, verdict: &DmarcVerdict) {
        self.sections
            .push(format!("dmarc={} header.from={}", verdict.status, verdict.domain));
    }

    pub fn add_arc(&mut self, verdict: &ArcVerdict) {
        let section = match verdict.status {
            ArcStatus::None => "arc=none".to_string(),
            ArcStatus::Pass => format!("arc=pass (i={})", verdict.instance),
            ArcStatus::Fail => match &verdict.detail {
                Some(detail) => format!("arc=fail ({})", comment(detail)),
                None => "arc=fail".to_string(),
            },
        };
        self.sections.push(section);
    }

    pub fn add_bimi(&mut self, verdict: &BimiVerdict) {
        let mut section = format!("bimi={}", verdict.status);
        if let Some(ref detail) = verdict.detail {
            section.push_str(&format!(" ({})", comment(detail)));
        }
        if verdict.status == crate::bimi::BimiStatus::Pass {
            section.push_str(&format!(
                " header.d={} header.selector={}",
                verdict.domain, verdict.selector
            ));
        }
        self.sections.push(section);
    }

    /// The complete header, one folded method section per line.
    pub fn header(&self) -> String {
        let mut out = format!("Authentication-Results: {}", self.mta);
        if self.sections.is_empty() {
            out.push_str("; none");
        } else {
            for section in &self.sections {
                out.push_str(";\r\n ");
                out.push_str(&fold(section, 1, AUTH_RESULTS_WIDTH));
            }
        }
        out.push_str("\r\n");
        out
    }

    /// Single-line payload for ARC-Authentication-Results: the MTA id
    /// followed by every method section.
    pub fn arc_payload(&self) -> String {
        let mut out = self.mta.clone();
        for section in &self.sections {
            out.push_str("; ");
            out.push_str(section);
        }
        out
    }
}

/// Format the `Received-SPF` header for a verdict.
pub fn received_spf(verdict: &SpfVerdict) -> String {
    let mut line = format!("Received-SPF: {}", verdict.result);
    if let Some(ref explanation) = verdict.explanation {
        line.push_str(&format!(" ({})", comment(explanation)));
    }
    line.push_str(&format!(
        " client-ip={}; envelope-from=\"{}\"; helo={};",
        verdict.client_ip, verdict.sender, verdict.helo
    ));
    if let Some(ref record) = verdict.record {
        line.push_str(&format!(" rr=\"{}\"", comment(record)));
    }

    let folded = fold(&line, 0, RECEIVED_SPF_WIDTH);
    format!("{folded}\r\n")
}

/// Sanitize text destined for a comment or quoted string: comments
/// must not nest or break out, and headers must stay on one logical
/// line.
fn comment(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '(' | ')' | '"' | '\\' => '\'',
            '\r' | '\n' => ' ',
            c => c,
        })
        .collect()
}

/// Fold a line at space boundaries; continuations are indented with
/// one space.
fn fold(line: &str, indent: usize, width: usize) -> String {
    let mut out = String::with_capacity(line.len());
    let mut current = indent;
    for (i, word) in line.split(' ').enumerate() {
        if i == 0 {
            out.push_str(word);
            current += word.len();
            continue;
        }
        if current + 1 + word.len() > width {
            out.push_str("\r\n ");
            current = 1;
        } else {
            out.push(' ');
            current += 1;
        }
        out.push_str(word);
        current += word.len();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkim::Algorithm;
    use crate::spf::SpfResult;
    use std::net::IpAddr;

    fn spf_pass() -> SpfVerdict {
        SpfVerdict {
            result: SpfResult::Pass,
            domain: "example.com".into(),
            sender: "alice@example.com".into(),
            client_ip: IpAddr::from([192, 0, 2, 1]),
            helo: "mail.example.com".into(),
            mechanism: Some("mx".into()),
            explanation: None,
            record: Some("v=spf1 mx -all".into()),
            lookups: 3,
        }
    }

    fn dkim_pass() -> DkimVerdict {
        DkimVerdict {
            status: DkimStatus::Pass,
            domain: "ekiri.ee".into(),
            selector: "default".into(),
            auid: "@ekiri.ee".into(),
            algorithm: Some(Algorithm::RsaSha256),
            signature_prefix: "AbCdEfGh".into(),
            detail: None,
            policy: None,
            testing: false,
        }
    }

    #[test]
    fn received_spf_format() {
        let header = received_spf(&spf_pass());
        assert!(header.starts_with("Received-SPF: pass"));
        assert!(header.contains("client-ip=192.0.2.1;"));
        assert!(header.contains("envelope-from=\"alice@example.com\";"));
        assert!(header.contains("helo=mail.example.com;"));
        assert!(header.contains("rr=\"v=spf1 mx -all\""));
        assert!(header.ends_with("\r\n"));
    }

    #[test]
    fn received_spf_folds_long_lines() {
        let mut verdict = spf_pass();
        verdict.explanation = Some("x".repeat(220));
        let header = received_spf(&verdict);
        for line in header.trim_end().split("\r\n") {
            // One oversized unbreakable token is tolerated, plain text
            // is not.
            assert!(line.len() <= 230);
        }
        assert!(header.contains("\r\n "));
    }

    #[test]
    fn auth_results_full_stack() {
        let mut results = AuthResults::new("mx.example.com");
        results.add_dkim(&dkim_pass());
        results.add_spf(&spf_pass());
        results.add_dmarc(&DmarcVerdict {
            status: crate::dmarc::DmarcStatus::None,
            domain: "ekiri.ee".into(),
            aligned: None,
            record: None,
            record_domain: None,
        });

        let header = results.header();
        assert!(header.starts_with("Authentication-Results: mx.example.com;\r\n "));
        assert!(header.contains(
            "dkim=pass header.i=@ekiri.ee header.s=default header.a=rsa-sha256 header.b=\"AbCdEfGh\""
        ));
        assert!(header.contains("spf=pass ("));
        assert!(header.contains("smtp.mailfrom=alice@example.com smtp.helo=mail.example.com"));
        assert!(header.contains("dmarc=none header.from=ekiri.ee"));
    }

    #[test]
    fn weak_key_policy_annotation() {
        let mut verdict = dkim_pass();
        verdict.status = DkimStatus::Policy;
        verdict.policy = Some("weak-key");

        let mut results = AuthResults::new("mx");
        results.add_dkim(&verdict);
        assert!(results.header().contains("dkim=policy"));
        assert!(results.header().contains("policy.dkim-rules=weak-key"));
    }

    #[test]
    fn arc_sections() {
        let mut results = AuthResults::new("mx");
        results.add_arc(&ArcVerdict {
            status: ArcStatus::Pass,
            instance: 2,
            oldest_pass: Some(1),
            detail: None,
        });
        assert!(results.header().contains("arc=pass (i=2)"));

        let mut results = AuthResults::new("mx");
        results.add_arc(&ArcVerdict::fail("instance 2: seal bad".into()));
        assert!(results.header().contains("arc=fail (instance 2: seal bad)"));
    }

    #[test]
    fn empty_results_say_none() {
        let results = AuthResults::new("mx.example.com");
        assert_eq!(
            results.header(),
            "Authentication-Results: mx.example.com; none\r\n"
        );
    }

    #[test]
    fn arc_payload_single_line() {
        let mut results = AuthResults::new("mx.example.com");
        results.add_spf(&spf_pass());
        let payload = results.arc_payload();
        assert!(payload.starts_with("mx.example.com; spf=pass"));
        assert!(!payload.contains("\r\n"));
    }

    #[test]
    fn comment_text_sanitized() {
        let mut verdict = spf_pass();
        verdict.explanation = Some("evil) breakout (\r\ninjected".into());
        let header = received_spf(&verdict);
        assert!(header.contains("evil' breakout '"));
        // No parenthesis breakout, no raw header injection.
        assert!(!header.contains("breakout ("));
        assert!(!header.contains("\r\ninjected"));
    }
}
