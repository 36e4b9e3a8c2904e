//! ARC sealing (RFC 8617 §5.1): emit AAR, AMS, and AS for the next
//! chain instance.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::common::domain;
use crate::dkim::canon::{
    canonicalize_header_relaxed, hash_body, select_headers, BodyHashRequest,
};
use crate::dkim::sign::{append_b_value, fold_signature_value, PrivateKey};
use crate::dkim::{CanonicalizationMethod, HashAlgorithm, SignatureKind};
use crate::error::AuthError;
use crate::message::Message;

use super::parse::{collect_arc_sets, ArcSet};
use super::verify::seal_input;
use super::{ArcStatus, ArcVerdict, ChainValidation};

/// Headers AMS signs by default, filtered to those present.
const DEFAULT_SEALED_HEADERS: &[&str] = &[
    "from",
    "to",
    "subject",
    "date",
    "message-id",
    "mime-version",
    "content-type",
    "dkim-signature",
];

/// The three headers of a freshly minted ARC set. Values start with a
/// space; emit as `<Name>:<value>`, newest set on top.
#[derive(Debug)]
pub struct SealOutput {
    pub aar: String,
    pub ams: String,
    pub seal: String,
}

/// ARC sealer: holds the sealing key and identity.
pub struct ArcSealer {
    domain: String,
    selector: String,
    key: PrivateKey,
    headers_to_sign: Vec<String>,
    timestamp_override: Option<u64>,
}

impl ArcSealer {
    pub fn ed25519(
        domain: impl Into<String>,
        selector: impl Into<String>,
        pkcs8: &[u8],
    ) -> Result<Self, AuthError> {
        Ok(Self::with_key(domain, selector, PrivateKey::load_ed25519(pkcs8)?))
    }

    pub fn rsa_sha256(
        domain: impl Into<String>,
        selector: impl Into<String>,
        pkcs8: &[u8],
    ) -> Result<Self, AuthError> {
        Ok(Self::with_key(domain, selector, PrivateKey::load_rsa(pkcs8)?))
    }

    fn with_key(domain: impl Into<String>, selector: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            key,
            headers_to_sign: DEFAULT_SEALED_HEADERS.iter().map(|s| s.to_string()).collect(),
            timestamp_override: None,
        }
    }

    /// Headers for the AMS `h=` list. ARC and Authentication-Results
    /// headers are never signed and are filtered out here.
    pub fn headers(mut self, headers: &[&str]) -> Self {
        self.headers_to_sign = headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .filter(|h| !is_sealing_header(h))
            .collect();
        self
    }

    /// Fix the sealing time, for reproducible output.
    pub fn timestamp(mut self, unix_seconds: u64) -> Self {
        self.timestamp_override = Some(unix_seconds);
        self
    }

    /// Seal a message.
    ///
    /// `chain` is the validation verdict for the chain as received
    /// (`ArcVerdict::none()` for a pristine message) and decides the
    /// emitted `cv=`. `auth_results` is the AAR payload after `i=N;`,
    /// conventionally `<mta>; <method results>`.
    pub fn seal(
        &self,
        message: &Message<'_>,
        chain: &ArcVerdict,
        auth_results: &str,
    ) -> Result<SealOutput, AuthError> {
        let existing = collect_arc_sets(message)?;

        if chain.status == ArcStatus::Fail {
            return Err(AuthError::ArcChainBroken(
                "cannot seal over a failed chain".into(),
            ));
        }

        let instance = existing.len() as u32 + 1;
        if instance > 50 {
            return Err(AuthError::ArcChainBroken("instance limit 50 exceeded".into()));
        }
        let cv = if existing.is_empty() {
            ChainValidation::None
        } else {
            ChainValidation::Pass
        };

        let timestamp = self.timestamp_override.unwrap_or_else(now);
        let d_ascii = domain::to_ascii(&self.domain).map_err(AuthError::ConfigError)?;
        let s_ascii = domain::to_ascii(&self.selector).map_err(AuthError::ConfigError)?;

        let aar = format!(" i={instance}; {auth_results}");
        let ams = self.build_ams(message, instance, timestamp, &d_ascii, &s_ascii)?;
        let seal = self.build_seal(
            &existing, &aar, &ams, instance, cv, timestamp, &d_ascii, &s_ascii,
        )?;

        Ok(SealOutput { aar, ams, seal })
    }

    fn build_ams(
        &self,
        message: &Message<'_>,
        instance: u32,
        timestamp: u64,
        d_ascii: &str,
        s_ascii: &str,
    ) -> Result<String, AuthError> {
        let body_hash = hash_body(
            BodyHashRequest {
                canonicalization: CanonicalizationMethod::Relaxed,
                hash: HashAlgorithm::Sha256,
                limit: None,
            },
            message.body,
        );

        // Sign only headers that exist; over-signing is a DKIM tactic,
        // not an ARC one.
        let h_list: Vec<String> = self
            .headers_to_sign
            .iter()
            .filter(|h| message.first(h).is_some())
            .cloned()
            .collect();

        let mut tags: Vec<String> = Vec::new();
        for tag in SignatureKind::ArcMessage.tag_order() {
            match *tag {
                "i" => tags.push(format!("i={instance}")),
                "a" => tags.push(format!("a={}", self.key.algorithm())),
                "c" => tags.push("c=relaxed/relaxed".into()),
                "d" => tags.push(format!("d={d_ascii}")),
                "h" => tags.push(format!("h={}", h_list.join(":"))),
                "s" => tags.push(format!("s={s_ascii}")),
                "t" => tags.push(format!("t={timestamp}")),
                "bh" => tags.push(format!("bh={}", STANDARD.encode(&body_hash.digest))),
                "b" => tags.push("b=".into()),
                _ => {}
            }
        }
        let mut value = fold_signature_value(SignatureKind::ArcMessage.header_name(), &tags);

        let pairs = message.as_pairs();
        let mut input = Vec::new();
        for line in select_headers(CanonicalizationMethod::Relaxed, &h_list, &pairs) {
            input.extend_from_slice(line.as_bytes());
        }
        let own = canonicalize_header_relaxed(SignatureKind::ArcMessage.header_name(), &value);
        let own = own.strip_suffix("\r\n").unwrap_or(&own);
        input.extend_from_slice(own.as_bytes());

        let signature = self.key.sign(&input)?;
        append_b_value(
            SignatureKind::ArcMessage.header_name(),
            &mut value,
            &STANDARD.encode(&signature),
        );
        Ok(value)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_seal(
        &self,
        existing: &[ArcSet],
        new_aar: &str,
        new_ams: &str,
        instance: u32,
        cv: ChainValidation,
        timestamp: u64,
        d_ascii: &str,
        s_ascii: &str,
    ) -> Result<String, AuthError> {
        let mut tags: Vec<String> = Vec::new();
        for tag in SignatureKind::ArcSeal.tag_order() {
            match *tag {
                "i" => tags.push(format!("i={instance}")),
                "a" => tags.push(format!("a={}", self.key.algorithm())),
                "t" => tags.push(format!("t={timestamp}")),
                "cv" => tags.push(format!("cv={cv}")),
                "d" => tags.push(format!("d={d_ascii}")),
                "s" => tags.push(format!("s={s_ascii}")),
                "b" => tags.push("b=".into()),
                _ => {}
            }
        }
        let mut value = fold_signature_value(SignatureKind::ArcSeal.header_name(), &tags);

        // Prior chain in ascending order, then the new set with this
        // seal's b= empty and no trailing CRLF.
        let mut input = seal_input(existing, u32::MAX);
        let aar = canonicalize_header_relaxed("ARC-Authentication-Results", new_aar);
        input.extend_from_slice(aar.as_bytes());
        let ams = canonicalize_header_relaxed("ARC-Message-Signature", new_ams);
        input.extend_from_slice(ams.as_bytes());
        let own = canonicalize_header_relaxed(SignatureKind::ArcSeal.header_name(), &value);
        let own = own.strip_suffix("\r\n").unwrap_or(&own);
        input.extend_from_slice(own.as_bytes());

        let signature = self.key.sign(&input)?;
        append_b_value(
            SignatureKind::ArcSeal.header_name(),
            &mut value,
            &STANDARD.encode(&signature),
        );
        Ok(value)
    }
}

fn is_sealing_header(name: &str) -> bool {
    name.starts_with("arc-") || name == "authentication-results"
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::Ed25519KeyPair;

    fn gen_pkcs8() -> Vec<u8> {
        let rng = SystemRandom::new();
        Ed25519KeyPair::generate_pkcs8(&rng).unwrap().as_ref().to_vec()
    }

    fn sample_message() -> Vec<u8> {
        b"From: sender@example.com\r\n\
          To: rcpt@example.org\r\n\
          Subject: Seal test\r\n\
          DKIM-Signature: v=1; a=rsa-sha256; d=example.com; s=s; h=from; bh=aA==; b=Yg==\r\n\
          \r\n\
          Seal me\r\n"
            .to_vec()
    }

    fn tag(header: &str, name: &str) -> Option<String> {
        let unfolded: String = header
            .chars()
            .filter(|c| *c != '\r' && *c != '\n')
            .collect();
        for part in unfolded.split(';') {
            if let Some((t, v)) = part.trim().split_once('=') {
                if t.trim() == name {
                    return Some(v.split_whitespace().collect());
                }
            }
        }
        None
    }

    #[test]
    fn first_instance_gets_cv_none() {
        let raw = sample_message();
        let message = Message::parse(&raw).unwrap();
        let sealer = ArcSealer::ed25519("relay.example", "arc", &gen_pkcs8()).unwrap();

        let output = sealer
            .seal(&message, &ArcVerdict::none(), "mx.relay.example; dkim=pass")
            .unwrap();

        assert!(output.aar.starts_with(" i=1; mx.relay.example"));
        assert_eq!(tag(&output.seal, "i").as_deref(), Some("1"));
        assert_eq!(tag(&output.seal, "cv").as_deref(), Some("none"));
        assert_eq!(tag(&output.ams, "i").as_deref(), Some("1"));
    }

    #[test]
    fn ams_signs_only_present_headers_and_never_arc() {
        let raw = sample_message();
        let message = Message::parse(&raw).unwrap();
        let sealer = ArcSealer::ed25519("relay.example", "arc", &gen_pkcs8()).unwrap();

        let output = sealer
            .seal(&message, &ArcVerdict::none(), "mx; dkim=pass")
            .unwrap();

        let h = tag(&output.ams, "h").unwrap();
        let names: Vec<&str> = h.split(':').collect();
        assert!(names.contains(&"from"));
        assert!(names.contains(&"dkim-signature"));
        // date absent from the message → absent from h=.
        assert!(!names.contains(&"date"));
        assert!(!names.iter().any(|n| n.starts_with("arc-")));
    }

    #[test]
    fn custom_header_list_filters_sealing_headers() {
        let sealer = ArcSealer::ed25519("relay.example", "arc", &gen_pkcs8())
            .unwrap()
            .headers(&["from", "ARC-Seal", "authentication-results", "subject"]);
        assert_eq!(sealer.headers_to_sign, vec!["from", "subject"]);
    }

    #[test]
    fn seal_refuses_failed_chain() {
        let raw = sample_message();
        let message = Message::parse(&raw).unwrap();
        let sealer = ArcSealer::ed25519("relay.example", "arc", &gen_pkcs8()).unwrap();

        let err = sealer
            .seal(&message, &ArcVerdict::fail("broken".into()), "mx; none")
            .unwrap_err();
        assert!(matches!(err, AuthError::ArcChainBroken(_)));
    }

    #[test]
    fn seal_tag_order_on_the_wire() {
        let raw = sample_message();
        let message = Message::parse(&raw).unwrap();
        let sealer = ArcSealer::ed25519("relay.example", "arc", &gen_pkcs8())
            .unwrap()
            .timestamp(1_700_000_000);

        let output = sealer
            .seal(&message, &ArcVerdict::none(), "mx; dkim=pass")
            .unwrap();

        let unfolded: String = output
            .seal
            .chars()
            .filter(|c| *c != '\r' && *c != '\n')
            .collect();
        let i = unfolded.find("i=1").unwrap();
        let a = unfolded.find("a=ed25519-sha256").unwrap();
        let t = unfolded.find("t=1700000000").unwrap();
        let cv = unfolded.find("cv=none").unwrap();
        let d = unfolded.find("d=relay.example").unwrap();
        let b = unfolded.rfind("b=").unwrap();
        assert!(i < a && a < t && t < cv && cv < d && d < b);
    }

    #[test]
    fn instance_limit_enforced() {
        // 50 syntactically complete sets already on the message.
        let mut raw = Vec::new();
        for i in (1..=50).rev() {
            let cv = if i == 1 { "none" } else { "pass" };
            raw.extend_from_slice(
                format!(
                    "ARC-Seal: i={i}; a=rsa-sha256; cv={cv}; d=x.com; s=s; t=1; b=Yg==\r\n\
                     ARC-Message-Signature: i={i}; a=rsa-sha256; d=x.com; s=s; h=from; bh=aA==; b=Yg==\r\n\
                     ARC-Authentication-Results: i={i}; mx; dkim=pass\r\n"
                )
                .as_bytes(),
            );
        }
        raw.extend_from_slice(b"From: a@example.com\r\n\r\nbody\r\n");
        let message = Message::parse(&raw).unwrap();

        let sealer = ArcSealer::ed25519("relay.example", "arc", &gen_pkcs8()).unwrap();
        let verdict = ArcVerdict {
            status: ArcStatus::Pass,
            instance: 50,
            oldest_pass: Some(50),
            detail: None,
        };
        let err = sealer.seal(&message, &verdict, "mx; dkim=pass").unwrap_err();
        assert!(err.to_string().contains("instance limit"));
    }
}
