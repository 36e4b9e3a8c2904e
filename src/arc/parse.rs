//! ARC set discovery: group AAR/AMS/AS headers by instance and check
//! chain structure.

use crate::dkim::signature::parse_instance;
use crate::dkim::{Algorithm, DkimSignature, SignatureKind};
use crate::error::AuthError;
use crate::message::Message;
use crate::tags::TagList;

use super::ChainValidation;

/// An ARC-Authentication-Results header.
#[derive(Debug, Clone)]
pub struct ArcAuthResults {
    pub instance: u32,
    /// Content after the leading `i=N;`.
    pub payload: String,
    /// Full header value as received.
    pub raw_value: String,
}

impl ArcAuthResults {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let trimmed = value.trim_start();
        let (first, rest) = trimmed.split_once(';').ok_or_else(|| {
            AuthError::MalformedTagList("ARC-Authentication-Results without i= tag".into())
        })?;
        let instance_value = first
            .trim()
            .strip_prefix("i=")
            .ok_or_else(|| AuthError::MalformedTagList("AAR must begin with i=".into()))?;
        Ok(ArcAuthResults {
            instance: parse_instance(instance_value.trim())?,
            payload: rest.trim().to_string(),
            raw_value: value.to_string(),
        })
    }
}

/// An ARC-Seal header.
#[derive(Debug, Clone)]
pub struct ArcSeal {
    pub instance: u32,
    pub algorithm: Algorithm,
    pub cv: ChainValidation,
    pub domain: String,
    pub selector: String,
    pub timestamp: Option<u64>,
    pub signature: Vec<u8>,
    pub raw_value: String,
}

impl ArcSeal {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let tags = TagList::parse(value)?;
        let required = |name: &str| {
            tags.get(name)
                .ok_or_else(|| AuthError::MalformedTagList(format!("seal missing {name}= tag")))
        };

        let algorithm_tag = required("a")?;
        let signature = STANDARD
            .decode(
                tags.get_unfolded("b")
                    .ok_or_else(|| AuthError::MalformedTagList("seal missing b= tag".into()))?,
            )
            .map_err(|_| AuthError::MalformedTagList("invalid base64 in seal b=".into()))?;

        Ok(ArcSeal {
            instance: parse_instance(required("i")?)?,
            algorithm: Algorithm::from_tag(algorithm_tag)
                .ok_or_else(|| AuthError::AlgorithmUnsupported(algorithm_tag.to_string()))?,
            cv: ChainValidation::parse(required("cv")?)?,
            domain: crate::common::domain::normalize(required("d")?),
            selector: required("s")?.to_string(),
            timestamp: tags.get("t").and_then(|t| t.parse().ok()),
            signature,
            raw_value: value.to_string(),
        })
    }
}

/// One complete ARC set.
#[derive(Debug, Clone)]
pub struct ArcSet {
    pub instance: u32,
    pub aar: ArcAuthResults,
    pub ams: DkimSignature,
    /// Index of the AMS header in the message header list.
    pub ams_index: usize,
    pub seal: ArcSeal,
}

/// Collect and structurally validate the ARC sets of a message.
///
/// Returns sets in ascending instance order. Duplicate headers for an
/// instance, incomplete triples, and gaps all break the chain.
pub fn collect_arc_sets(message: &Message<'_>) -> Result<Vec<ArcSet>, AuthError> {
    let mut aars: Vec<ArcAuthResults> = Vec::new();
    let mut amss: Vec<(usize, DkimSignature)> = Vec::new();
    let mut seals: Vec<ArcSeal> = Vec::new();

    for (idx, header) in message.headers.iter().enumerate() {
        match header.lower.as_str() {
            "arc-authentication-results" => aars.push(ArcAuthResults::parse(&header.value)?),
            "arc-message-signature" => amss.push((
                idx,
                DkimSignature::parse(SignatureKind::ArcMessage, &header.value)?,
            )),
            "arc-seal" => seals.push(ArcSeal::parse(&header.value)?),
            _ => {}
        }
    }

    if aars.is_empty() && amss.is_empty() && seals.is_empty() {
        return Ok(Vec::new());
    }

    let highest = aars
        .iter()
        .map(|a| a.instance)
        .chain(amss.iter().filter_map(|(_, s)| s.instance))
        .chain(seals.iter().map(|s| s.instance))
        .max()
        .unwrap_or(0);

    let mut sets = Vec::with_capacity(highest as usize);
    for instance in 1..=highest {
        let aar = take_unique(&mut aars, |a| a.instance == instance, instance, "AAR")?;
        let (ams_index, ams) = take_unique(
            &mut amss,
            |(_, s)| s.instance == Some(instance),
            instance,
            "AMS",
        )?;
        let seal = take_unique(&mut seals, |s| s.instance == instance, instance, "AS")?;
        sets.push(ArcSet {
            instance,
            aar,
            ams,
            ams_index,
            seal,
        });
    }

    // Anything left over duplicates an instance.
    if !aars.is_empty() || !amss.is_empty() || !seals.is_empty() {
        return Err(AuthError::ArcChainBroken(
            "duplicate ARC headers for an instance".into(),
        ));
    }

    Ok(sets)
}

fn take_unique<T>(
    pool: &mut Vec<T>,
    matches: impl Fn(&T) -> bool,
    instance: u32,
    what: &str,
) -> Result<T, AuthError> {
    let mut found: Option<usize> = None;
    for (i, item) in pool.iter().enumerate() {
        if matches(item) {
            if found.is_some() {
                return Err(AuthError::ArcChainBroken(format!(
                    "duplicate {what} for instance {instance}"
                )));
            }
            found = Some(i);
        }
    }
    match found {
        Some(i) => Ok(pool.remove(i)),
        None => Err(AuthError::ArcChainBroken(format!(
            "missing {what} for instance {instance}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc_headers(instance: u32, cv: &str) -> String {
        format!(
            "ARC-Authentication-Results: i={instance}; mx.example.com; spf=pass\r\n\
             ARC-Message-Signature: i={instance}; a=rsa-sha256; d=example.com; s=arc; \
             h=from; bh=aA==; b=Yg==\r\n\
             ARC-Seal: i={instance}; a=rsa-sha256; cv={cv}; d=example.com; s=arc; t=1; b=Yg==\r\n"
        )
    }

    fn message_with(arc: &str) -> Vec<u8> {
        format!("{arc}From: a@example.com\r\n\r\nbody\r\n").into_bytes()
    }

    #[test]
    fn no_arc_headers_is_empty() {
        let raw = message_with("");
        let msg = Message::parse(&raw).unwrap();
        assert!(collect_arc_sets(&msg).unwrap().is_empty());
    }

    #[test]
    fn single_set_collected() {
        let raw = message_with(&arc_headers(1, "none"));
        let msg = Message::parse(&raw).unwrap();
        let sets = collect_arc_sets(&msg).unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].instance, 1);
        assert_eq!(sets[0].aar.payload, "mx.example.com; spf=pass");
        assert_eq!(sets[0].seal.cv, ChainValidation::None);
        assert_eq!(sets[0].ams.instance, Some(1));
    }

    #[test]
    fn two_sets_in_ascending_order() {
        let arc = format!("{}{}", arc_headers(2, "pass"), arc_headers(1, "none"));
        let raw = message_with(&arc);
        let msg = Message::parse(&raw).unwrap();
        let sets = collect_arc_sets(&msg).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].instance, 1);
        assert_eq!(sets[1].instance, 2);
    }

    #[test]
    fn gap_in_instances_breaks_chain() {
        let arc = format!("{}{}", arc_headers(1, "none"), arc_headers(3, "pass"));
        let raw = message_with(&arc);
        let msg = Message::parse(&raw).unwrap();
        let err = collect_arc_sets(&msg).unwrap_err();
        assert!(err.to_string().contains("instance 2"));
    }

    #[test]
    fn incomplete_triple_breaks_chain() {
        let arc = "ARC-Seal: i=1; a=rsa-sha256; cv=none; d=e.com; s=s; b=Yg==\r\n";
        let raw = message_with(arc);
        let msg = Message::parse(&raw).unwrap();
        assert!(collect_arc_sets(&msg).is_err());
    }

    #[test]
    fn duplicate_instance_breaks_chain() {
        let arc = format!("{}{}", arc_headers(1, "none"), arc_headers(1, "none"));
        let raw = message_with(&arc);
        let msg = Message::parse(&raw).unwrap();
        let err = collect_arc_sets(&msg).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn aar_requires_leading_instance() {
        assert!(ArcAuthResults::parse(" spf=pass; dkim=pass").is_err());
        let aar = ArcAuthResults::parse(" i=3; mx.host; spf=pass").unwrap();
        assert_eq!(aar.instance, 3);
        assert_eq!(aar.payload, "mx.host; spf=pass");
    }

    #[test]
    fn seal_parse_rejects_bad_cv() {
        let err = ArcSeal::parse(" i=1; a=rsa-sha256; cv=maybe; d=e.com; s=s; b=Yg==").unwrap_err();
        assert!(err.to_string().contains("cv="));
    }
}
