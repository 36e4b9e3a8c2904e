//! DKIM public key records (`<selector>._domainkey.<domain>` TXT).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::AuthError;
use crate::tags::TagList;

/// Asymmetric key family from the `k=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    #[default]
    Rsa,
    Ed25519,
}

/// A parsed DKIM key record.
#[derive(Debug, Clone)]
pub struct DkimPublicKey {
    /// Concatenated TXT record, as fetched.
    pub raw: String,
    pub version: Option<String>,
    pub key_type: KeyType,
    /// Decoded `p=` bytes: SubjectPublicKeyInfo DER for RSA, raw
    /// 32-byte key for Ed25519. Empty when revoked.
    pub public_key: Vec<u8>,
    /// `p=` was present but empty.
    pub revoked: bool,
    /// `t=y` — domain is testing DKIM.
    pub testing: bool,
    /// `t=s` — `i=` must equal `d=` exactly.
    pub strict_identity: bool,
    pub notes: Option<String>,
    /// `h=` whitelist of hash algorithm names, when present.
    pub hash_algorithms: Option<Vec<String>>,
    /// `s=` service types, when present.
    pub service_types: Option<Vec<String>>,
}

impl DkimPublicKey {
    /// Parse a key record. Multi-string TXT fragments must already be
    /// concatenated verbatim (no whitespace inserted between them).
    pub fn parse(txt: &str) -> Result<Self, AuthError> {
        let tags = TagList::parse(txt).map_err(|e| match e {
            AuthError::MalformedTagList(d) => AuthError::MalformedTagList(format!("key record: {d}")),
            other => other,
        })?;

        if let Some(version) = tags.get("v") {
            if version != "DKIM1" {
                return Err(AuthError::KeyUnsupported(format!(
                    "unknown key record version: {version}"
                )));
            }
        }

        let key_type = match tags.get("k") {
            None => KeyType::Rsa,
            Some(k) => match k.to_ascii_lowercase().as_str() {
                "rsa" => KeyType::Rsa,
                "ed25519" => KeyType::Ed25519,
                other => return Err(AuthError::KeyUnsupported(format!("key type: {other}"))),
            },
        };

        let (public_key, revoked) = match tags.get_unfolded("p") {
            None => return Err(AuthError::KeyMissing),
            Some(p) if p.is_empty() => (Vec::new(), true),
            Some(p) => (
                STANDARD
                    .decode(p.as_bytes())
                    .map_err(|_| AuthError::KeyUnsupported("invalid base64 in p=".into()))?,
                false,
            ),
        };

        let list = |name: &str| {
            tags.get(name).map(|v| {
                v.split(':')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
        };

        let mut testing = false;
        let mut strict_identity = false;
        if let Some(flags) = tags.get("t") {
            for flag in flags.split(':') {
                match flag.trim().to_ascii_lowercase().as_str() {
                    "y" => testing = true,
                    "s" => strict_identity = true,
                    _ => {}
                }
            }
        }

        Ok(DkimPublicKey {
            raw: txt.to_string(),
            version: tags.get("v").map(String::from),
            key_type,
            public_key,
            revoked,
            testing,
            strict_identity,
            notes: tags.get("n").map(String::from),
            hash_algorithms: list("h"),
            service_types: list("s"),
        })
    }

    /// Key size in bits: RSA modulus width, or 256 for Ed25519.
    pub fn bit_length(&self) -> Option<usize> {
        match self.key_type {
            KeyType::Ed25519 => Some(256),
            KeyType::Rsa => rsa_modulus_bits(strip_spki_wrapper(&self.public_key)),
        }
    }
}

/// Unwrap a SubjectPublicKeyInfo to the inner PKCS#1 RSAPublicKey.
/// DKIM `p=` carries SPKI DER; ring's RSA verifier wants PKCS#1.
/// Input that is already PKCS#1 is returned unchanged.
pub(crate) fn strip_spki_wrapper(spki_der: &[u8]) -> &[u8] {
    // OID 1.2.840.113549.1.1.1 (rsaEncryption)
    const RSA_OID: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

    if spki_der.len() < 24 || spki_der[0] != 0x30 {
        return spki_der;
    }
    let Some(oid_pos) = spki_der.windows(RSA_OID.len()).position(|w| w == RSA_OID) else {
        return spki_der;
    };

    let mut pos = oid_pos + RSA_OID.len();
    // Optional NULL parameters
    if spki_der.len() > pos + 1 && spki_der[pos] == 0x05 && spki_der[pos + 1] == 0x00 {
        pos += 2;
    }
    // BIT STRING wrapping the RSAPublicKey
    if pos < spki_der.len() && spki_der[pos] == 0x03 {
        pos += 1;
        let (len, consumed) = parse_asn1_length(&spki_der[pos..]);
        pos += consumed;
        // Skip the unused-bits octet.
        if len > 0 && pos < spki_der.len() {
            pos += 1;
            if pos < spki_der.len() {
                return &spki_der[pos..];
            }
        }
    }

    spki_der
}

/// Modulus bit width from a PKCS#1 RSAPublicKey.
fn rsa_modulus_bits(pkcs1: &[u8]) -> Option<usize> {
    // SEQUENCE { INTEGER modulus, INTEGER publicExponent }
    if pkcs1.first() != Some(&0x30) {
        return None;
    }
    let mut pos = 1;
    let (_, consumed) = parse_asn1_length(&pkcs1[pos..]);
    pos += consumed;

    if pkcs1.get(pos) != Some(&0x02) {
        return None;
    }
    pos += 1;
    let (len, consumed) = parse_asn1_length(&pkcs1[pos..]);
    pos += consumed;

    let modulus = pkcs1.get(pos..pos + len)?;
    // Drop the sign-padding zero byte, then any further leading zeros.
    let mut first = 0;
    while first < modulus.len() && modulus[first] == 0 {
        first += 1;
    }
    let significant = &modulus[first..];
    let high = *significant.first()?;
    Some(significant.len() * 8 - high.leading_zeros() as usize)
}

/// DER length decoding. Returns `(length, bytes_consumed)`.
pub(crate) fn parse_asn1_length(data: &[u8]) -> (usize, usize) {
    match data.first() {
        None => (0, 0),
        Some(&b) if b < 0x80 => (b as usize, 1),
        Some(&b) => {
            let count = (b & 0x7f) as usize;
            if count == 0 || count > 4 || data.len() < 1 + count {
                return (0, 1);
            }
            let mut len = 0usize;
            for &byte in &data[1..1 + count] {
                len = (len << 8) | byte as usize;
            }
            (len, 1 + count)
        }
    }
}
