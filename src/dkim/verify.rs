//! DKIM signature verification.
//!
//! Per-signature errors never abort the run; each one degrades to a
//! verdict and the remaining signatures continue.

use std::time::{SystemTime, UNIX_EPOCH};

use ring::signature as ring_sig;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver};
use crate::common::domain;
use crate::error::AuthError;
use crate::message::Message;

use super::canon::{
    canonicalize_header, select_headers, strip_b_tag_value, BodyHashRequest, BodyHashes,
};
use super::key::{strip_spki_wrapper, DkimPublicKey, KeyType};
use super::signature::{Algorithm, DkimSignature, HashAlgorithm};
use super::{DkimStatus, DkimVerdict, SignatureKind};

/// Default allowance for clock drift when checking `t=`/`x=`.
const DEFAULT_CLOCK_SKEW: u64 = 300;

/// DKIM signature verifier over an injected resolver.
pub struct DkimVerifier<'a, R: DnsResolver> {
    resolver: &'a R,
    clock_skew: u64,
    min_key_bits: usize,
    strict: bool,
    now_override: Option<u64>,
}

impl<'a, R: DnsResolver> DkimVerifier<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self {
            resolver,
            clock_skew: DEFAULT_CLOCK_SKEW,
            min_key_bits: 1024,
            strict: false,
            now_override: None,
        }
    }

    pub fn clock_skew(mut self, seconds: u64) -> Self {
        self.clock_skew = seconds;
        self
    }

    /// RSA keys below this report `dkim=policy` with a weak-key note.
    pub fn min_key_bits(mut self, bits: usize) -> Self {
        self.min_key_bits = bits;
        self
    }

    /// Strict mode rejects sha1 signatures outright.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Evaluate against a fixed clock, for reproducible tests.
    pub fn at_time(mut self, unix_seconds: u64) -> Self {
        self.now_override = Some(unix_seconds);
        self
    }

    /// Body-hash tuples needed by the message's DKIM signatures.
    /// Unparseable signature headers contribute nothing; they fail on
    /// their own later.
    pub fn hash_requests(message: &Message<'_>) -> Vec<BodyHashRequest> {
        message
            .headers_named("dkim-signature")
            .filter_map(|(_, h)| DkimSignature::parse(SignatureKind::Dkim, &h.value).ok())
            .map(|sig| sig.body_hash_request())
            .collect()
    }

    /// Verify every DKIM-Signature header, computing body hashes in a
    /// single pass over the body.
    pub async fn verify_message(&self, message: &Message<'_>) -> Vec<DkimVerdict> {
        let hashes = BodyHashes::compute(Self::hash_requests(message), message.body);
        self.verify_with_hashes(message, &hashes).await
    }

    /// Verify using body hashes computed elsewhere (the aggregator
    /// shares one pass between DKIM and ARC).
    pub async fn verify_with_hashes(
        &self,
        message: &Message<'_>,
        hashes: &BodyHashes,
    ) -> Vec<DkimVerdict> {
        let indices: Vec<usize> = message
            .headers_named("dkim-signature")
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            return vec![DkimVerdict::none()];
        }

        let mut verdicts = Vec::with_capacity(indices.len());
        for idx in indices {
            let verdict = self.verify_single(message, idx, hashes).await;
            debug!(status = %verdict.status, domain = %verdict.domain, "dkim signature checked");
            verdicts.push(verdict);
        }
        verdicts
    }

    async fn verify_single(
        &self,
        message: &Message<'_>,
        sig_idx: usize,
        hashes: &BodyHashes,
    ) -> DkimVerdict {
        let value = &message.headers[sig_idx].value;

        let sig = match DkimSignature::parse(SignatureKind::Dkim, value) {
            Ok(sig) => sig,
            Err(e) => return parse_failure_verdict(&e),
        };

        if self.strict && sig.algorithm.hash_algorithm() == HashAlgorithm::Sha1 {
            return verdict(
                &sig,
                DkimStatus::PermError,
                Some("sha1 signatures rejected in strict mode".into()),
            );
        }

        // Timestamp sanity before spending a DNS query.
        let now = self.now();
        if let Some(expiration) = sig.expiration {
            if now > expiration + self.clock_skew {
                return verdict(&sig, DkimStatus::Fail, Some("signature expired".into()));
            }
        }
        if let Some(timestamp) = sig.timestamp {
            if timestamp > now + self.clock_skew {
                return verdict(
                    &sig,
                    DkimStatus::Neutral,
                    Some("signature timestamp in the future".into()),
                );
            }
        }

        let key = match fetch_key(self.resolver, &sig.selector, &sig.domain).await {
            Ok(key) => key,
            Err(FetchError::Temp(detail)) => {
                return verdict(&sig, DkimStatus::TempError, Some(detail))
            }
            Err(FetchError::Perm(detail)) => {
                return verdict(&sig, DkimStatus::PermError, Some(detail))
            }
        };

        if let Some(result) = check_key_constraints(&sig, &key) {
            return result;
        }

        // Weak-RSA policy check precedes any use of the key. Ed25519
        // keys are fixed-size and exempt.
        if let Some(bits) = key.bit_length().filter(|_| key.key_type == KeyType::Rsa) {
            if bits < self.min_key_bits {
                let mut v = verdict(
                    &sig,
                    DkimStatus::Policy,
                    Some(format!(
                        "key length {bits} below minimum {} bits",
                        self.min_key_bits
                    )),
                );
                v.policy = Some("weak-key");
                v.testing = key.testing;
                return v;
            }
        }

        // Body hash.
        let request = sig.body_hash_request();
        let Some(body_hash) = hashes.get(&request) else {
            // Request set and signature list diverged; recompute would
            // hide the bug, so report it.
            return verdict(
                &sig,
                DkimStatus::PermError,
                Some("no body hash computed for signature".into()),
            );
        };
        if let Some(limit) = sig.body_length {
            if limit > body_hash.canonical_length {
                return verdict(
                    &sig,
                    DkimStatus::Fail,
                    Some(AuthError::BodyLengthMismatch.to_string()),
                );
            }
        }
        let matches: bool = body_hash.digest.ct_eq(&sig.body_hash).into();
        if !matches {
            return verdict(
                &sig,
                DkimStatus::Fail,
                Some("body hash does not match bh= value".into()),
            );
        }

        // Header hash + signature.
        let pairs = message.as_pairs();
        let data = build_header_input(&sig, &pairs, sig_idx);
        match verify_signature_bytes(sig.algorithm, &key, &data, &sig.signature) {
            Ok(()) => {
                let mut v = verdict(&sig, DkimStatus::Pass, None);
                v.testing = key.testing;
                v
            }
            Err(detail) => verdict(&sig, DkimStatus::Fail, Some(detail)),
        }
    }

    fn now(&self) -> u64 {
        self.now_override.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
    }
}

// ---------------------------------------------------------------------------
// Key retrieval
// ---------------------------------------------------------------------------

pub(crate) enum FetchError {
    Temp(String),
    Perm(String),
}

/// Fetch and parse `{selector}._domainkey.{domain}`.
pub(crate) async fn fetch_key<R: DnsResolver>(
    resolver: &R,
    selector: &str,
    domain: &str,
) -> Result<DkimPublicKey, FetchError> {
    let selector = domain::to_ascii(selector).map_err(FetchError::Perm)?;
    let domain = domain::to_ascii(domain).map_err(FetchError::Perm)?;
    let name = format!("{selector}._domainkey.{domain}");
    if !domain::is_valid_hostname(&name) {
        return Err(FetchError::Perm(format!("invalid key record name: {name}")));
    }

    let records = match resolver.query_txt(&name).await {
        Ok(records) => records,
        Err(DnsError::NotFound) => {
            return Err(FetchError::Perm(format!("no key record at {name}")))
        }
        Err(DnsError::TempFail(e)) => {
            return Err(FetchError::Temp(format!("DNS failure for {name}: {e}")))
        }
        Err(DnsError::PermFail(e)) => {
            return Err(FetchError::Perm(format!("DNS failure for {name}: {e}")))
        }
    };
    if records.is_empty() {
        return Err(FetchError::Perm(format!("no key record at {name}")));
    }

    // A name can hold several TXT records; take the first that parses
    // as a key record.
    let mut last_error = None;
    for record in &records {
        match DkimPublicKey::parse(record) {
            Ok(key) => return Ok(key),
            Err(e) => last_error = Some(e),
        }
    }
    Err(FetchError::Perm(
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unparseable key record".into()),
    ))
}

fn check_key_constraints(sig: &DkimSignature, key: &DkimPublicKey) -> Option<DkimVerdict> {
    if key.revoked {
        return Some(verdict(
            sig,
            DkimStatus::PermError,
            Some(AuthError::KeyRevoked.to_string()),
        ));
    }

    if let Some(ref hashes) = key.hash_algorithms {
        let required = sig.algorithm.hash_algorithm().as_str();
        if !hashes.iter().any(|h| h == required) {
            return Some(verdict(
                sig,
                DkimStatus::Fail,
                Some(format!("key h= tag does not permit {required}")),
            ));
        }
    }

    if let Some(ref services) = key.service_types {
        if !services.iter().any(|s| s == "email" || s == "*") {
            return Some(verdict(
                sig,
                DkimStatus::PermError,
                Some("key s= tag does not cover email".into()),
            ));
        }
    }

    if key.strict_identity {
        if let Some(ref auid) = sig.auid {
            let auid_domain = auid.rsplit_once('@').map(|(_, d)| d).unwrap_or(auid);
            if !domain::domains_equal(auid_domain, &sig.domain) {
                return Some(verdict(
                    sig,
                    DkimStatus::Fail,
                    Some("key t=s requires i= domain to equal d=".into()),
                ));
            }
        }
    }

    let expected = match sig.algorithm {
        Algorithm::RsaSha1 | Algorithm::RsaSha256 => KeyType::Rsa,
        Algorithm::Ed25519Sha256 => KeyType::Ed25519,
    };
    if key.key_type != expected {
        return Some(verdict(
            sig,
            DkimStatus::PermError,
            Some(format!(
                "key type {:?} incompatible with {}",
                key.key_type, sig.algorithm
            )),
        ));
    }

    None
}

// ---------------------------------------------------------------------------
// Signing input + crypto
// ---------------------------------------------------------------------------

/// Build the header signing input for a signature located at
/// `sig_idx` in the message header list. Shared with ARC.
pub(crate) fn build_header_input(
    sig: &DkimSignature,
    headers: &[(&str, &str)],
    sig_idx: usize,
) -> Vec<u8> {
    let filtered: Vec<(&str, &str)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != sig_idx)
        .map(|(_, h)| *h)
        .collect();

    let mut input = Vec::new();
    for line in select_headers(sig.canonicalization.header, &sig.signed_headers, &filtered) {
        input.extend_from_slice(line.as_bytes());
    }

    // The signature header itself, with the b= value emptied and no
    // trailing CRLF. Simple canonicalization keeps the received name
    // casing.
    let stripped = strip_b_tag_value(&sig.raw_value);
    let own_name = headers[sig_idx].0;
    let canonical = canonicalize_header(sig.canonicalization.header, own_name, &stripped);
    let canonical = canonical.strip_suffix("\r\n").unwrap_or(&canonical);
    input.extend_from_slice(canonical.as_bytes());
    input
}

/// Verify raw signature bytes with ring, selecting parameters from the
/// algorithm and key size.
pub(crate) fn verify_signature_bytes(
    algorithm: Algorithm,
    key: &DkimPublicKey,
    data: &[u8],
    signature: &[u8],
) -> Result<(), String> {
    let key_bytes: &[u8] = match key.key_type {
        KeyType::Rsa => strip_spki_wrapper(&key.public_key),
        KeyType::Ed25519 => &key.public_key,
    };

    let params: &dyn ring_sig::VerificationAlgorithm = match algorithm {
        Algorithm::RsaSha256 => {
            if key_bytes.len() >= 256 {
                &ring_sig::RSA_PKCS1_2048_8192_SHA256
            } else {
                &ring_sig::RSA_PKCS1_1024_8192_SHA256_FOR_LEGACY_USE_ONLY
            }
        }
        Algorithm::RsaSha1 => {
            if key_bytes.len() >= 256 {
                &ring_sig::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY
            } else {
                &ring_sig::RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY
            }
        }
        Algorithm::Ed25519Sha256 => {
            if key_bytes.len() != 32 {
                return Err(format!(
                    "invalid Ed25519 public key length: {}",
                    key_bytes.len()
                ));
            }
            &ring_sig::ED25519
        }
    };

    ring_sig::UnparsedPublicKey::new(params, key_bytes)
        .verify(data, signature)
        .map_err(|_| AuthError::SignatureMismatch.to_string())
}

fn verdict(sig: &DkimSignature, status: DkimStatus, detail: Option<String>) -> DkimVerdict {
    DkimVerdict {
        status,
        domain: sig.domain.clone(),
        selector: sig.selector.clone(),
        auid: sig
            .auid
            .clone()
            .unwrap_or_else(|| format!("@{}", sig.domain)),
        algorithm: Some(sig.algorithm),
        signature_prefix: sig.signature_prefix(),
        detail,
        policy: None,
        testing: false,
    }
}

fn parse_failure_verdict(error: &AuthError) -> DkimVerdict {
    DkimVerdict {
        status: DkimStatus::PermError,
        domain: String::new(),
        selector: String::new(),
        auid: String::new(),
        algorithm: None,
        signature_prefix: String::new(),
        detail: Some(error.to_string()),
        policy: None,
        testing: false,
    }
}
