//! Header and body canonicalization (RFC 6376 §3.4).
//!
//! Body canonicalization is streaming: [`BodyCanonicalizer`] accepts
//! bytes in arbitrary chunks and produces identical output regardless
//! of chunking, holding only a small trailing-whitespace/CRLF state.
//! [`BodyHasher`] feeds that output into a digest, honoring `l=`
//! truncation, and [`BodyHashes`] runs one hasher per distinct
//! `(canonicalization, algorithm, limit)` tuple over a single pass.

use std::collections::HashMap;

use ring::digest;

use super::signature::{CanonicalizationMethod, HashAlgorithm};

// ---------------------------------------------------------------------------
// Header canonicalization
// ---------------------------------------------------------------------------

/// Simple header canonicalization: the original bytes, terminated with
/// CRLF if missing.
pub fn canonicalize_header_simple(name: &str, value: &str) -> String {
    let mut out = format!("{name}:{value}");
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out
}

/// Relaxed header canonicalization: lowercase name, unfold, collapse
/// WSP runs to single SP, trim edges, single `:` with no surrounding
/// whitespace, CRLF terminated.
pub fn canonicalize_header_relaxed(name: &str, value: &str) -> String {
    let mut collapsed = String::with_capacity(value.len());
    let mut in_wsp = false;
    for ch in value.chars() {
        match ch {
            // Unfold: line breaks inside a header value vanish; the
            // whitespace that follows them collapses like any other.
            '\r' | '\n' => continue,
            ' ' | '\t' => {
                if !in_wsp {
                    collapsed.push(' ');
                    in_wsp = true;
                }
            }
            _ => {
                collapsed.push(ch);
                in_wsp = false;
            }
        }
    }
    let trimmed = collapsed.trim_matches(' ');
    format!("{}:{}\r\n", name.to_ascii_lowercase(), trimmed)
}

pub fn canonicalize_header(method: CanonicalizationMethod, name: &str, value: &str) -> String {
    match method {
        CanonicalizationMethod::Simple => canonicalize_header_simple(name, value),
        CanonicalizationMethod::Relaxed => canonicalize_header_relaxed(name, value),
    }
}

/// Select and canonicalize the headers named in `h=`.
///
/// Instances are consumed bottom-up: the first mention of a name takes
/// the last occurrence in the message, the second mention the one
/// before it, and so on. A name with no remaining occurrence
/// (over-signing) contributes one empty canonical line.
pub fn select_headers(
    method: CanonicalizationMethod,
    signed_headers: &[String],
    message_headers: &[(&str, &str)],
) -> Vec<String> {
    let mut consumed: HashMap<String, usize> = HashMap::new();
    let mut result = Vec::with_capacity(signed_headers.len());

    for h_name in signed_headers {
        let lower = h_name.to_ascii_lowercase();
        let count = consumed.entry(lower.clone()).or_insert(0);

        let occurrences: Vec<usize> = message_headers
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| name.eq_ignore_ascii_case(&lower))
            .map(|(i, _)| i)
            .collect();

        if *count < occurrences.len() {
            let idx = occurrences[occurrences.len() - 1 - *count];
            let (name, value) = message_headers[idx];
            result.push(canonicalize_header(method, name, value));
            *count += 1;
        } else {
            result.push(format!("{lower}:\r\n"));
        }
    }

    result
}

/// Remove the `b=` tag's value from a signature header value, keeping
/// `b=` itself. `bh=` is untouched.
///
/// Tag values cannot contain `;`, so splitting on it is structurally
/// safe — a `b=` lookalike inside base64 data (`…+b==`) stays inside
/// its own segment and cannot be mistaken for the tag.
pub fn strip_b_tag_value(header_value: &str) -> String {
    let is_fws = |c: char| matches!(c, ' ' | '\t' | '\r' | '\n');
    let mut result = String::with_capacity(header_value.len());

    for (i, segment) in header_value.split(';').enumerate() {
        if i > 0 {
            result.push(';');
        }
        match segment.find('=') {
            Some(pos) if segment[..pos].trim_matches(is_fws) == "b" => {
                result.push_str(&segment[..=pos]);
            }
            _ => result.push_str(segment),
        }
    }

    result
}

// ---------------------------------------------------------------------------
// Streaming body canonicalization
// ---------------------------------------------------------------------------

/// Streaming body canonicalizer.
///
/// Line breaks (CRLF or bare LF) and, in relaxed mode, whitespace runs
/// are held back until the next content byte decides their fate, which
/// is what makes trailing-blank-line stripping possible in one pass.
#[derive(Debug)]
pub struct BodyCanonicalizer {
    method: CanonicalizationMethod,
    pending_cr: bool,
    pending_breaks: u64,
    pending_wsp: bool,
    seen_content: bool,
}

impl BodyCanonicalizer {
    pub fn new(method: CanonicalizationMethod) -> Self {
        Self {
            method,
            pending_cr: false,
            pending_breaks: 0,
            pending_wsp: false,
            seen_content: false,
        }
    }

    /// Feed a chunk; returns the canonical bytes it produced.
    pub fn update(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for &b in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if b == b'\n' {
                    self.line_break();
                    continue;
                }
                // Lone CR is ordinary content.
                self.content(b'\r', &mut out);
            }
            match b {
                b'\r' => self.pending_cr = true,
                b'\n' => self.line_break(),
                b' ' | b'\t' if self.method == CanonicalizationMethod::Relaxed => {
                    self.pending_wsp = true;
                }
                _ => self.content(b, &mut out),
            }
        }
        out
    }

    /// Flush trailing state. Simple mode always ends with exactly one
    /// CRLF (an empty body canonicalizes to CRLF); relaxed mode ends
    /// with CRLF only when any content was produced.
    pub fn finish(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.pending_cr {
            self.pending_cr = false;
            self.content(b'\r', &mut out);
        }
        if self.seen_content || self.method == CanonicalizationMethod::Simple {
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    fn line_break(&mut self) {
        self.pending_wsp = false;
        self.pending_breaks += 1;
    }

    fn content(&mut self, b: u8, out: &mut Vec<u8>) {
        for _ in 0..self.pending_breaks {
            out.extend_from_slice(b"\r\n");
        }
        self.pending_breaks = 0;
        if self.pending_wsp {
            out.push(b' ');
            self.pending_wsp = false;
        }
        out.push(b);
        self.seen_content = true;
    }
}

/// One-shot canonicalization, for tests and small bodies.
pub fn canonicalize_body(method: CanonicalizationMethod, body: &[u8]) -> Vec<u8> {
    let mut canon = BodyCanonicalizer::new(method);
    let mut out = canon.update(body);
    out.extend_from_slice(&canon.finish());
    out
}

// ---------------------------------------------------------------------------
// Body hashing
// ---------------------------------------------------------------------------

/// The tuple identifying one body hash computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BodyHashRequest {
    pub canonicalization: CanonicalizationMethod,
    pub hash: HashAlgorithm,
    /// `l=` limit: hash only the first N canonical octets.
    pub limit: Option<u64>,
}

/// A finished body hash plus the full canonical length, which callers
/// need to detect `l=` values longer than the body.
#[derive(Debug, Clone)]
pub struct BodyHash {
    pub digest: Vec<u8>,
    pub canonical_length: u64,
}

/// Streaming hasher: canonicalizer → digest, with `l=` truncation.
pub struct BodyHasher {
    request: BodyHashRequest,
    canon: BodyCanonicalizer,
    ctx: digest::Context,
    hashed: u64,
    canonical_length: u64,
}

impl BodyHasher {
    pub fn new(request: BodyHashRequest) -> Self {
        let algorithm: &'static digest::Algorithm = match request.hash {
            HashAlgorithm::Sha256 => &digest::SHA256,
            HashAlgorithm::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        };
        Self {
            request,
            canon: BodyCanonicalizer::new(request.canonicalization),
            ctx: digest::Context::new(algorithm),
            hashed: 0,
            canonical_length: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        let canonical = self.canon.update(chunk);
        self.digest(&canonical);
    }

    pub fn finish(mut self) -> BodyHash {
        let tail = std::mem::replace(
            &mut self.canon,
            BodyCanonicalizer::new(self.request.canonicalization),
        )
        .finish();
        self.digest(&tail);
        BodyHash {
            digest: self.ctx.finish().as_ref().to_vec(),
            canonical_length: self.canonical_length,
        }
    }

    fn digest(&mut self, canonical: &[u8]) {
        self.canonical_length += canonical.len() as u64;
        match self.request.limit {
            None => {
                self.ctx.update(canonical);
                self.hashed += canonical.len() as u64;
            }
            Some(limit) => {
                if self.hashed < limit {
                    let take = ((limit - self.hashed) as usize).min(canonical.len());
                    self.ctx.update(&canonical[..take]);
                    self.hashed += take as u64;
                }
            }
        }
    }
}

/// One-shot body hash.
pub fn hash_body(request: BodyHashRequest, body: &[u8]) -> BodyHash {
    let mut hasher = BodyHasher::new(request);
    hasher.update(body);
    hasher.finish()
}

/// Deduplicated body hashes for all signatures of one message: a
/// single pass over the body feeds every hasher in file order.
#[derive(Debug, Default)]
pub struct BodyHashes {
    hashes: HashMap<BodyHashRequest, BodyHash>,
}

impl BodyHashes {
    pub fn compute(requests: impl IntoIterator<Item = BodyHashRequest>, body: &[u8]) -> Self {
        let mut hashers: Vec<BodyHasher> = Vec::new();
        for request in requests {
            if !hashers.iter().any(|h| h.request == request) {
                hashers.push(BodyHasher::new(request));
            }
        }

        for chunk in body.chunks(8192) {
            for hasher in &mut hashers {
                hasher.update(chunk);
            }
        }

        BodyHashes {
            hashes: hashers
                .into_iter()
                .map(|h| (h.request, h.finish()))
                .collect(),
        }
    }

    pub fn get(&self, request: &BodyHashRequest) -> Option<&BodyHash> {
        self.hashes.get(request)
    }
}
