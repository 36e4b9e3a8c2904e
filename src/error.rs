use thiserror::Error;

/// Engine-level error taxonomy.
///
/// Most of these never escape `authenticate`: DKIM problems degrade the
/// offending signature's verdict, SPF problems map to SPF result codes,
/// and DMARC fails open as `none`. Only [`AuthError::MalformedMessage`]
/// (truly unparseable input) and [`AuthError::Cancelled`] reach the
/// caller.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("malformed tag list: {0}")]
    MalformedTagList(String),
    #[error("DNS temporary failure: {0}")]
    DnsTempError(String),
    #[error("DNS permanent failure: {0}")]
    DnsPermError(String),
    #[error("no public key record published")]
    KeyMissing,
    #[error("public key revoked (empty p= tag)")]
    KeyRevoked,
    #[error("unsupported key type: {0}")]
    KeyUnsupported(String),
    #[error("key length {bits} below minimum {min} bits")]
    KeyTooShort { bits: usize, min: usize },
    #[error("unsupported algorithm: {0}")]
    AlgorithmUnsupported(String),
    #[error("canonicalization mismatch: {0}")]
    CanonicalizationMismatch(String),
    #[error("body length limit exceeds canonicalized body")]
    BodyLengthMismatch,
    #[error("signature does not verify")]
    SignatureMismatch,
    #[error("ARC chain broken: {0}")]
    ArcChainBroken(String),
    #[error("too many DNS lookups")]
    LookupLimitExceeded,
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("operation cancelled")]
    Cancelled,
}
