//! Parsing of DKIM-Signature and ARC-Message-Signature header values.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::common::domain;
use crate::error::AuthError;
use crate::tags::TagList;

use super::canon::BodyHashRequest;
use super::SignatureKind;

/// Signing algorithm from the `a=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RsaSha1,
    RsaSha256,
    Ed25519Sha256,
}

impl Algorithm {
    pub fn from_tag(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "rsa-sha1" => Some(Algorithm::RsaSha1),
            "rsa-sha256" => Some(Algorithm::RsaSha256),
            "ed25519-sha256" => Some(Algorithm::Ed25519Sha256),
            _ => None,
        }
    }

    pub fn hash_algorithm(self) -> HashAlgorithm {
        match self {
            Algorithm::RsaSha1 => HashAlgorithm::Sha1,
            Algorithm::RsaSha256 | Algorithm::Ed25519Sha256 => HashAlgorithm::Sha256,
        }
    }
}

impl Algorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::RsaSha1 => "rsa-sha1",
            Algorithm::RsaSha256 => "rsa-sha256",
            Algorithm::Ed25519Sha256 => "ed25519-sha256",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hash function used for body and header hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

/// `simple` or `relaxed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CanonicalizationMethod {
    #[default]
    Simple,
    Relaxed,
}

impl fmt::Display for CanonicalizationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CanonicalizationMethod::Simple => "simple",
            CanonicalizationMethod::Relaxed => "relaxed",
        })
    }
}

/// The `c=` pair. Defaults to `simple/simple` per RFC 6376.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Canonicalization {
    pub header: CanonicalizationMethod,
    pub body: CanonicalizationMethod,
}

impl Canonicalization {
    pub const RELAXED: Canonicalization = Canonicalization {
        header: CanonicalizationMethod::Relaxed,
        body: CanonicalizationMethod::Relaxed,
    };

    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let mut parts = value.split('/');
        let header = parse_method(parts.next().unwrap_or("simple"))?;
        let body = match parts.next() {
            Some(b) => parse_method(b)?,
            None => CanonicalizationMethod::Simple,
        };
        Ok(Canonicalization { header, body })
    }
}

impl fmt::Display for Canonicalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.header, self.body)
    }
}

fn parse_method(value: &str) -> Result<CanonicalizationMethod, AuthError> {
    match value.to_ascii_lowercase().as_str() {
        "simple" => Ok(CanonicalizationMethod::Simple),
        "relaxed" => Ok(CanonicalizationMethod::Relaxed),
        other => Err(AuthError::CanonicalizationMismatch(format!(
            "unknown canonicalization: {other}"
        ))),
    }
}

/// A parsed DKIM-style signature header (DKIM or ARC-Message-Signature,
/// chosen by [`SignatureKind`]).
#[derive(Debug, Clone)]
pub struct DkimSignature {
    pub kind: SignatureKind,
    /// ARC instance; present only for ARC signatures.
    pub instance: Option<u32>,
    pub algorithm: Algorithm,
    pub canonicalization: Canonicalization,
    pub domain: String,
    pub selector: String,
    pub signed_headers: Vec<String>,
    pub body_hash: Vec<u8>,
    pub signature: Vec<u8>,
    pub auid: Option<String>,
    pub body_length: Option<u64>,
    pub timestamp: Option<u64>,
    pub expiration: Option<u64>,
    /// Raw header value as received, needed to rebuild the signing
    /// input byte-exactly.
    pub raw_value: String,
}

impl DkimSignature {
    /// Parse a signature header value.
    pub fn parse(kind: SignatureKind, value: &str) -> Result<Self, AuthError> {
        let tags = TagList::parse(value)?;

        match kind {
            SignatureKind::Dkim => {
                let version = tags
                    .get("v")
                    .ok_or_else(|| missing("v"))?;
                if version != "1" {
                    return Err(AuthError::MalformedTagList(format!(
                        "unsupported signature version: {version}"
                    )));
                }
            }
            SignatureKind::ArcMessage => {}
            SignatureKind::ArcSeal => {
                return Err(AuthError::ConfigError(
                    "ARC-Seal headers use their own parser".into(),
                ))
            }
        }

        let instance = match kind {
            SignatureKind::Dkim => None,
            _ => Some(parse_instance(tags.get("i").ok_or_else(|| missing("i"))?)?),
        };

        let algorithm_tag = tags.get("a").ok_or_else(|| missing("a"))?;
        let algorithm = Algorithm::from_tag(algorithm_tag)
            .ok_or_else(|| AuthError::AlgorithmUnsupported(algorithm_tag.to_string()))?;

        let canonicalization = match tags.get("c") {
            // ARC-Message-Signature defaults to relaxed/relaxed.
            None if kind == SignatureKind::ArcMessage => Canonicalization::RELAXED,
            None => Canonicalization::default(),
            Some(c) => Canonicalization::parse(c)?,
        };

        let domain = domain::normalize(tags.get("d").ok_or_else(|| missing("d"))?);
        if domain.is_empty() {
            return Err(AuthError::MalformedTagList("empty d= tag".into()));
        }
        let selector = tags.get("s").ok_or_else(|| missing("s"))?.to_string();
        if selector.is_empty() {
            return Err(AuthError::MalformedTagList("empty s= tag".into()));
        }

        let signed_headers: Vec<String> = tags
            .get("h")
            .ok_or_else(|| missing("h"))?
            .split(':')
            .map(|h| h.trim_matches(|c: char| c.is_whitespace()).to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if signed_headers.is_empty() {
            return Err(AuthError::MalformedTagList("empty h= tag".into()));
        }
        if kind == SignatureKind::Dkim && !signed_headers.iter().any(|h| h == "from") {
            return Err(AuthError::MalformedTagList(
                "h= does not include the From header".into(),
            ));
        }

        let body_hash = decode_b64(&tags, "bh")?;
        let signature = decode_b64(&tags, "b")?;
        if signature.is_empty() {
            return Err(AuthError::MalformedTagList("empty b= tag".into()));
        }

        let auid = tags.get("i").filter(|_| kind == SignatureKind::Dkim).map(String::from);
        if let Some(ref auid) = auid {
            let auid_domain = auid.rsplit_once('@').map(|(_, d)| d).unwrap_or(auid);
            if !domain::domains_equal(auid_domain, &domain)
                && !domain::is_subdomain_of(auid_domain, &domain)
            {
                return Err(AuthError::MalformedTagList(
                    "i= domain is not d= or a subdomain of it".into(),
                ));
            }
        }

        let body_length = parse_opt_u64(&tags, "l")?;
        let timestamp = parse_opt_u64(&tags, "t")?;
        let expiration = parse_opt_u64(&tags, "x")?;

        Ok(DkimSignature {
            kind,
            instance,
            algorithm,
            canonicalization,
            domain,
            selector,
            signed_headers,
            body_hash,
            signature,
            auid,
            body_length,
            timestamp,
            expiration,
            raw_value: value.to_string(),
        })
    }

    /// The body-hash computation this signature needs.
    pub fn body_hash_request(&self) -> BodyHashRequest {
        BodyHashRequest {
            canonicalization: self.canonicalization.body,
            hash: self.algorithm.hash_algorithm(),
            limit: self.body_length,
        }
    }

    /// First 8 characters of the base64 signature, for reporting.
    pub fn signature_prefix(&self) -> String {
        let b64 = STANDARD.encode(&self.signature);
        b64.chars().take(8).collect()
    }
}

pub(crate) fn parse_instance(value: &str) -> Result<u32, AuthError> {
    let instance: u32 = value
        .parse()
        .map_err(|_| AuthError::MalformedTagList(format!("invalid instance: {value}")))?;
    if !(1..=50).contains(&instance) {
        return Err(AuthError::MalformedTagList(format!(
            "instance out of range: {instance}"
        )));
    }
    Ok(instance)
}

fn missing(tag: &str) -> AuthError {
    AuthError::MalformedTagList(format!("missing required tag: {tag}"))
}

fn decode_b64(tags: &TagList, name: &str) -> Result<Vec<u8>, AuthError> {
    let value = tags
        .get_unfolded(name)
        .ok_or_else(|| missing(name))?;
    STANDARD
        .decode(value.as_bytes())
        .map_err(|_| AuthError::MalformedTagList(format!("invalid base64 in {name}=")))
}

fn parse_opt_u64(tags: &TagList, name: &str) -> Result<Option<u64>, AuthError> {
    match tags.get(name) {
        None => Ok(None),
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| AuthError::MalformedTagList(format!("invalid numeric {name}= tag"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "v=1; a=rsa-sha256; d=example.com; s=sel; \
                           h=from:to:subject; bh=aGFzaA==; b=c2ln";

    #[test]
    fn parse_minimal() {
        let sig = DkimSignature::parse(SignatureKind::Dkim, MINIMAL).unwrap();
        assert_eq!(sig.algorithm, Algorithm::RsaSha256);
        assert_eq!(sig.domain, "example.com");
        assert_eq!(sig.selector, "sel");
        assert_eq!(sig.signed_headers, vec!["from", "to", "subject"]);
        assert_eq!(sig.body_hash, b"hash");
        assert_eq!(sig.signature, b"sig");
        assert_eq!(sig.canonicalization, Canonicalization::default());
    }

    #[test]
    fn parse_canonicalization_pair() {
        let sig = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha256; c=relaxed/simple; d=example.com; s=sel; h=from; bh=aA==; b=Yg==",
        )
        .unwrap();
        assert_eq!(sig.canonicalization.header, CanonicalizationMethod::Relaxed);
        assert_eq!(sig.canonicalization.body, CanonicalizationMethod::Simple);
    }

    #[test]
    fn c_with_single_component_defaults_body_simple() {
        let sig = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha256; c=relaxed; d=example.com; s=sel; h=from; bh=aA==; b=Yg==",
        )
        .unwrap();
        assert_eq!(sig.canonicalization.header, CanonicalizationMethod::Relaxed);
        assert_eq!(sig.canonicalization.body, CanonicalizationMethod::Simple);
    }

    #[test]
    fn missing_from_rejected() {
        let err = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha256; d=example.com; s=sel; h=to:subject; bh=aA==; b=Yg==",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::MalformedTagList(_)));
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let err = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-md5; d=example.com; s=sel; h=from; bh=aA==; b=Yg==",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::AlgorithmUnsupported(_)));
    }

    #[test]
    fn auid_outside_domain_rejected() {
        let err = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha256; d=example.com; s=sel; i=user@other.com; h=from; bh=aA==; b=Yg==",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::MalformedTagList(_)));
    }

    #[test]
    fn auid_subdomain_accepted() {
        let sig = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha256; d=example.com; s=sel; i=@mail.example.com; h=from; bh=aA==; b=Yg==",
        )
        .unwrap();
        assert_eq!(sig.auid.as_deref(), Some("@mail.example.com"));
    }

    #[test]
    fn folded_base64_values_accepted() {
        let sig = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha256; d=example.com; s=sel; h=from;\r\n bh=aGFz\r\n aA==;\r\n b=c2ln\r\n c2ln",
        )
        .unwrap();
        assert_eq!(sig.body_hash, b"hash");
        assert_eq!(sig.signature, b"sigsig");
    }

    #[test]
    fn arc_message_signature_needs_instance() {
        let err = DkimSignature::parse(
            SignatureKind::ArcMessage,
            "a=rsa-sha256; d=example.com; s=sel; h=from; bh=aA==; b=Yg==",
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::MalformedTagList(_)));

        let sig = DkimSignature::parse(
            SignatureKind::ArcMessage,
            "i=2; a=rsa-sha256; d=example.com; s=sel; h=from; bh=aA==; b=Yg==",
        )
        .unwrap();
        assert_eq!(sig.instance, Some(2));
        assert_eq!(sig.canonicalization, Canonicalization::RELAXED);
    }

    #[test]
    fn arc_instance_range_enforced() {
        for bad in ["0", "51", "x"] {
            let value = format!("i={bad}; a=rsa-sha256; d=e.com; s=s; h=from; bh=aA==; b=Yg==");
            assert!(DkimSignature::parse(SignatureKind::ArcMessage, &value).is_err());
        }
    }

    #[test]
    fn body_hash_request_reflects_l_and_algorithm() {
        let sig = DkimSignature::parse(
            SignatureKind::Dkim,
            "v=1; a=rsa-sha1; c=simple/relaxed; d=e.com; s=s; h=from; l=42; bh=aA==; b=Yg==",
        )
        .unwrap();
        let req = sig.body_hash_request();
        assert_eq!(req.hash, HashAlgorithm::Sha1);
        assert_eq!(req.canonicalization, CanonicalizationMethod::Relaxed);
        assert_eq!(req.limit, Some(42));
    }

    #[test]
    fn signature_prefix_is_8_chars() {
        let sig = DkimSignature::parse(SignatureKind::Dkim, MINIMAL).unwrap();
        assert_eq!(sig.signature_prefix(), "c2ln");
        // Shorter than 8 only when the signature itself is short.
    }
}
