//! ARC chain validation (RFC 8617 §5.2).

use subtle::ConstantTimeEq;
use tracing::debug;

use crate::common::dns::DnsResolver;
use crate::dkim::canon::{
    canonicalize_header_relaxed, strip_b_tag_value, BodyHashRequest, BodyHashes,
};
use crate::dkim::verify::{build_header_input, fetch_key, verify_signature_bytes, FetchError};
use crate::dkim::{Algorithm, KeyType};
use crate::message::Message;

use super::parse::{collect_arc_sets, ArcSet};
use super::{ArcStatus, ArcVerdict, ChainValidation};

/// ARC chain verifier over an injected resolver.
pub struct ArcVerifier<'a, R: DnsResolver> {
    resolver: &'a R,
}

impl<'a, R: DnsResolver> ArcVerifier<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Body-hash tuples needed by the message's ARC signatures.
    pub fn hash_requests(message: &Message<'_>) -> Vec<BodyHashRequest> {
        match collect_arc_sets(message) {
            Ok(sets) => sets.iter().map(|s| s.ams.body_hash_request()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Validate the chain, computing body hashes internally.
    pub async fn verify_message(&self, message: &Message<'_>) -> ArcVerdict {
        let hashes = BodyHashes::compute(Self::hash_requests(message), message.body);
        self.verify_with_hashes(message, &hashes).await
    }

    /// Validate the chain using shared body hashes.
    pub async fn verify_with_hashes(
        &self,
        message: &Message<'_>,
        hashes: &BodyHashes,
    ) -> ArcVerdict {
        let sets = match collect_arc_sets(message) {
            Ok(sets) => sets,
            Err(e) => return ArcVerdict::fail(e.to_string()),
        };
        if sets.is_empty() {
            return ArcVerdict::none();
        }
        let newest = sets.last().expect("non-empty").instance;

        // cv structure first: it is cheap and a cv=fail anywhere is
        // permanent.
        for set in &sets {
            let expected = if set.instance == 1 {
                ChainValidation::None
            } else {
                ChainValidation::Pass
            };
            if set.seal.cv != expected {
                return ArcVerdict {
                    instance: newest,
                    ..ArcVerdict::fail(format!(
                        "instance {}: cv={} (expected {expected})",
                        set.instance, set.seal.cv
                    ))
                };
            }
        }

        // The newest AMS must verify over the message as delivered.
        if let Err(reason) = self.verify_ams(message, &sets[sets.len() - 1], hashes).await {
            return ArcVerdict {
                instance: newest,
                ..ArcVerdict::fail(format!("instance {newest}: AMS {reason}"))
            };
        }

        // Older message signatures usually break as hops modify the
        // message; record how deep the chain still validates.
        let mut oldest_pass = newest;
        for set in sets.iter().rev().skip(1) {
            match self.verify_ams(message, set, hashes).await {
                Ok(()) => oldest_pass = set.instance,
                Err(_) => break,
            }
        }

        // Every seal must verify over the chain up to its instance.
        for set in sets.iter().rev() {
            if let Err(reason) = self.verify_seal(&sets, set).await {
                return ArcVerdict {
                    instance: newest,
                    ..ArcVerdict::fail(format!(
                        "instance {}: seal {reason}",
                        set.instance
                    ))
                };
            }
        }

        debug!(instance = newest, oldest_pass, "arc chain validated");
        ArcVerdict {
            status: ArcStatus::Pass,
            instance: newest,
            oldest_pass: Some(oldest_pass),
            detail: None,
        }
    }

    async fn verify_ams(
        &self,
        message: &Message<'_>,
        set: &ArcSet,
        hashes: &BodyHashes,
    ) -> Result<(), String> {
        let ams = &set.ams;
        let key = fetch_and_check_key(self.resolver, &ams.selector, &ams.domain, ams.algorithm)
            .await?;

        let request = ams.body_hash_request();
        let body_hash = match hashes.get(&request) {
            Some(hash) => std::borrow::Cow::Borrowed(hash),
            None => std::borrow::Cow::Owned(crate::dkim::canon::hash_body(
                request,
                message.body,
            )),
        };
        if let Some(limit) = ams.body_length {
            if limit > body_hash.canonical_length {
                return Err("body length limit exceeds canonicalized body".into());
            }
        }
        let ok: bool = body_hash.digest.ct_eq(&ams.body_hash).into();
        if !ok {
            return Err("body hash mismatch".into());
        }

        let pairs = message.as_pairs();
        let data = build_header_input(ams, &pairs, set.ams_index);
        verify_signature_bytes(ams.algorithm, &key, &data, &ams.signature)
    }

    async fn verify_seal(&self, sets: &[ArcSet], target: &ArcSet) -> Result<(), String> {
        let seal = &target.seal;
        let key =
            fetch_and_check_key(self.resolver, &seal.selector, &seal.domain, seal.algorithm)
                .await?;
        let data = seal_input(sets, target.instance);
        verify_signature_bytes(seal.algorithm, &key, &data, &seal.signature)
    }
}

/// Fetch a key record and check it against the signature algorithm.
async fn fetch_and_check_key<R: DnsResolver>(
    resolver: &R,
    selector: &str,
    domain: &str,
    algorithm: Algorithm,
) -> Result<crate::dkim::DkimPublicKey, String> {
    let key = match fetch_key(resolver, selector, domain).await {
        Ok(key) => key,
        Err(FetchError::Temp(e)) | Err(FetchError::Perm(e)) => return Err(e),
    };
    if key.revoked {
        return Err("key revoked".into());
    }
    let expected = match algorithm {
        Algorithm::RsaSha1 | Algorithm::RsaSha256 => KeyType::Rsa,
        Algorithm::Ed25519Sha256 => KeyType::Ed25519,
    };
    if key.key_type != expected {
        return Err(format!(
            "key type {:?} incompatible with {algorithm}",
            key.key_type
        ));
    }
    Ok(key)
}

/// The byte stream an ARC-Seal at `target_instance` signs: every set
/// up to it in AAR, AMS, AS order (ascending), relaxed-canonicalized,
/// with the target seal's own `b=` emptied and the final CRLF dropped.
pub(crate) fn seal_input(sets: &[ArcSet], target_instance: u32) -> Vec<u8> {
    let mut data = Vec::new();

    for set in sets.iter().filter(|s| s.instance <= target_instance) {
        let aar =
            canonicalize_header_relaxed("ARC-Authentication-Results", &set.aar.raw_value);
        data.extend_from_slice(aar.as_bytes());

        let ams = canonicalize_header_relaxed("ARC-Message-Signature", &set.ams.raw_value);
        data.extend_from_slice(ams.as_bytes());

        if set.instance == target_instance {
            let stripped = strip_b_tag_value(&set.seal.raw_value);
            let seal = canonicalize_header_relaxed("ARC-Seal", &stripped);
            let seal = seal.strip_suffix("\r\n").unwrap_or(&seal);
            data.extend_from_slice(seal.as_bytes());
        } else {
            let seal = canonicalize_header_relaxed("ARC-Seal", &set.seal.raw_value);
            data.extend_from_slice(seal.as_bytes());
        }
    }

    data
}
