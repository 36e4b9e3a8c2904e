//! The authentication pipeline: one call runs SPF, DKIM, ARC, DMARC,
//! and BIMI over a raw message and emits the result headers.
//!
//! Cancellation is dropping the returned future: in-flight DNS queries
//! are dropped with it and no partial output exists anywhere.

use std::net::IpAddr;

use tracing::debug;

use crate::arc::{ArcSealer, ArcVerdict, SealOutput};
use crate::bimi::{BimiVerdict, BimiVerifier};
use crate::common::dns::DnsResolver;
use crate::common::domain;
use crate::dkim::canon::{BodyHashRequest, BodyHashes};
use crate::dkim::{DkimVerdict, DkimVerifier};
use crate::dmarc::{DmarcVerdict, DmarcVerifier};
use crate::error::AuthError;
use crate::message::Message;
use crate::report::{received_spf, AuthResults};
use crate::spf::eval::DEFAULT_MAX_LOOKUPS;
use crate::spf::{SpfVerdict, SpfVerifier};

/// SMTP envelope data accompanying a message. All fields optional;
/// [`Authenticator::trust_received`] can backfill them from headers.
#[derive(Debug, Clone, Default)]
pub struct SmtpContext {
    pub client_ip: Option<IpAddr>,
    pub helo: Option<String>,
    pub sender: Option<String>,
}

/// Everything one `authenticate` call produced.
#[derive(Debug)]
pub struct AuthOutcome {
    pub spf: Option<SpfVerdict>,
    pub dkim: Vec<DkimVerdict>,
    pub arc: Option<ArcVerdict>,
    pub dmarc: Option<DmarcVerdict>,
    pub bimi: Option<BimiVerdict>,
    pub seal: Option<SealOutput>,
    /// RFC5322.From domain used for alignment.
    pub from_domain: String,
    /// Wire-format headers to prepend, in emission order: sealing
    /// headers, `Received-SPF`, `Authentication-Results`.
    pub headers: String,
}

/// The single public entry point: configure once, call
/// [`Authenticator::authenticate`] per message.
pub struct Authenticator<R: DnsResolver> {
    resolver: R,
    mta: String,
    min_key_bits: usize,
    max_resolve_count: usize,
    clock_skew: u64,
    trust_received: bool,
    disable_arc: bool,
    disable_dmarc: bool,
    disable_bimi: bool,
    sealer: Option<ArcSealer>,
}

impl<R: DnsResolver> Authenticator<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            mta: "localhost".into(),
            min_key_bits: 1024,
            max_resolve_count: DEFAULT_MAX_LOOKUPS,
            clock_skew: 300,
            trust_received: false,
            disable_arc: false,
            disable_dmarc: false,
            disable_bimi: false,
            sealer: None,
        }
    }

    /// Hostname of this MTA; leads the Authentication-Results header
    /// and feeds the SPF `%{r}` macro.
    pub fn mta(mut self, hostname: impl Into<String>) -> Self {
        self.mta = hostname.into();
        self
    }

    /// Backfill missing SMTP context from the newest `Received:` and
    /// `Return-Path:` headers.
    pub fn trust_received(mut self) -> Self {
        self.trust_received = true;
        self
    }

    pub fn min_key_bits(mut self, bits: usize) -> Self {
        self.min_key_bits = bits;
        self
    }

    pub fn max_resolve_count(mut self, limit: usize) -> Self {
        self.max_resolve_count = limit;
        self
    }

    pub fn clock_skew(mut self, seconds: u64) -> Self {
        self.clock_skew = seconds;
        self
    }

    pub fn disable_arc(mut self) -> Self {
        self.disable_arc = true;
        self
    }

    pub fn disable_dmarc(mut self) -> Self {
        self.disable_dmarc = true;
        self
    }

    pub fn disable_bimi(mut self) -> Self {
        self.disable_bimi = true;
        self
    }

    /// Also seal the message with a new ARC set after validating it.
    pub fn seal_with(mut self, sealer: ArcSealer) -> Self {
        self.sealer = Some(sealer);
        self
    }

    /// Authenticate one message. Per-method problems degrade to their
    /// method's verdict; only an unparseable message is an `Err`.
    pub async fn authenticate(
        &self,
        raw: &[u8],
        context: &SmtpContext,
    ) -> Result<AuthOutcome, AuthError> {
        let message = Message::parse(raw)?;

        // Envelope data, possibly recovered from trace headers.
        let mut client_ip = context.client_ip;
        let mut helo = context.helo.clone();
        let mut sender = context.sender.clone();
        if self.trust_received {
            if client_ip.is_none() {
                if let Some((ip, received_helo)) = latest_received(&message) {
                    client_ip = Some(ip);
                    helo = helo.or(received_helo);
                }
            }
            if sender.is_none() {
                sender = latest_return_path(&message);
            }
        }
        let helo = helo.unwrap_or_else(|| "unknown".into());
        let sender = sender.unwrap_or_default();

        let from_domain = from_header_domain(&message)
            .or_else(|| domain::domain_from_email(&sender).map(str::to_string))
            .unwrap_or_else(|| helo.clone());

        // One pass over the body serves every signature.
        let mut requests: Vec<BodyHashRequest> = DkimVerifier::<R>::hash_requests(&message);
        if !self.disable_arc {
            requests.extend(crate::arc::ArcVerifier::<R>::hash_requests(&message));
        }
        let hashes = BodyHashes::compute(requests, message.body);

        // SPF and DKIM are independent; run them concurrently.
        let spf_future = async {
            match client_ip {
                Some(ip) => Some(
                    SpfVerifier::new(&self.resolver)
                        .max_lookups(self.max_resolve_count)
                        .receiver(self.mta.clone())
                        .evaluate(ip, &helo, &sender)
                        .await,
                ),
                None => None,
            }
        };
        let dkim_future = async {
            DkimVerifier::new(&self.resolver)
                .clock_skew(self.clock_skew)
                .min_key_bits(self.min_key_bits)
                .verify_with_hashes(&message, &hashes)
                .await
        };
        let (spf, dkim) = tokio::join!(spf_future, dkim_future);

        let arc = if self.disable_arc {
            None
        } else {
            Some(
                crate::arc::ArcVerifier::new(&self.resolver)
                    .verify_with_hashes(&message, &hashes)
                    .await,
            )
        };

        let dmarc = if self.disable_dmarc {
            None
        } else {
            Some(
                DmarcVerifier::new(&self.resolver)
                    .verify(&from_domain, spf.as_ref(), &dkim)
                    .await,
            )
        };

        let bimi = match (&dmarc, self.disable_bimi) {
            (Some(dmarc), false) => Some(
                BimiVerifier::new(&self.resolver)
                    .verify(&message, &from_domain, dmarc)
                    .await,
            ),
            _ => None,
        };

        // Build result sections: dkim, spf, dmarc, arc for the seal
        // payload; bimi joins only the visible header.
        let mut results = AuthResults::new(self.mta.as_str());
        for verdict in &dkim {
            results.add_dkim(verdict);
        }
        if let Some(ref spf) = spf {
            results.add_spf(spf);
        }
        if let Some(ref dmarc) = dmarc {
            results.add_dmarc(dmarc);
        }
        if let Some(ref arc) = arc {
            results.add_arc(arc);
        }
        let seal_payload = results.arc_payload();

        let seal = match (&self.sealer, &arc) {
            (Some(sealer), Some(chain)) => {
                match sealer.seal(&message, chain, &seal_payload) {
                    Ok(output) => Some(output),
                    Err(e) => {
                        debug!(error = %e, "sealing skipped");
                        None
                    }
                }
            }
            _ => None,
        };

        if let Some(ref bimi) = bimi {
            results.add_bimi(bimi);
        }

        // Fixed emission order: ARC set, Received-SPF,
        // Authentication-Results.
        let mut headers = String::new();
        if let Some(ref seal) = seal {
            headers.push_str(&format!("ARC-Seal:{}\r\n", seal.seal));
            headers.push_str(&format!("ARC-Message-Signature:{}\r\n", seal.ams));
            headers.push_str(&format!("ARC-Authentication-Results:{}\r\n", seal.aar));
        }
        if let Some(ref spf) = spf {
            headers.push_str(&received_spf(spf));
        }
        headers.push_str(&results.header());

        Ok(AuthOutcome {
            spf,
            dkim,
            arc,
            dmarc,
            bimi,
            seal,
            from_domain,
            headers,
        })
    }
}

// ---------------------------------------------------------------------------
// Trace header recovery
// ---------------------------------------------------------------------------

/// Client IP and EHLO name from the newest `Received:` header, which
/// conventionally reads `from <helo> (<host> [<ip>]) by …`.
fn latest_received(message: &Message<'_>) -> Option<(IpAddr, Option<String>)> {
    let header = message.first("received")?;
    let value = header.value.replace(['\r', '\n'], " ");

    let ip = value.find('[').and_then(|start| {
        let rest = &value[start + 1..];
        let end = rest.find(']')?;
        rest[..end]
            .trim()
            .trim_start_matches("IPv6:")
            .parse::<IpAddr>()
            .ok()
    })?;

    let mut tokens = value.split_whitespace();
    let helo = tokens
        .by_ref()
        .position(|t| t.eq_ignore_ascii_case("from"))
        .and_then(|_| tokens.next())
        .map(str::to_string);

    Some((ip, helo))
}

/// Envelope sender from the newest `Return-Path:` header.
fn latest_return_path(message: &Message<'_>) -> Option<String> {
    let value = message.first("return-path")?.value.trim().to_string();
    let inner = value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(&value);
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

// ---------------------------------------------------------------------------
// From header extraction
// ---------------------------------------------------------------------------

/// Domain of the first RFC5322.From mailbox. Handles display names,
/// comments, quoted strings with commas, folding, and address lists.
fn from_header_domain(message: &Message<'_>) -> Option<String> {
    let value = &message.first("from")?.value;
    let clean = strip_comments(value);
    let unfolded = clean.replace(['\r', '\n'], " ");

    // Angle brackets first: display names may contain commas.
    if let Some(start) = unfolded.find('<') {
        if let Some(len) = unfolded[start..].find('>') {
            let addr = unfolded[start + 1..start + len].trim();
            return domain::domain_from_email(addr).map(str::to_string);
        }
    }

    let first = unfolded.split(',').next().unwrap_or(&unfolded).trim();
    domain::domain_from_email(first).map(str::to_string)
}

/// Remove RFC 5322 comments, with nesting.
fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0u32;
    for c in s.chars() {
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}
