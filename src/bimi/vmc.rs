//! Verified Mark Certificate parsing.
//!
//! Extracts the subjectAltName dNSNames and the SVG indicator embedded
//! in the RFC 3709 logotype extension. Trust-chain verification is a
//! non-goal: this is extraction only.

use std::io::Read;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use flate2::read::GzDecoder;
use thiserror::Error;
use x509_parser::der_parser::oid::Oid;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

/// id-pe-logotype (RFC 3709).
const LOGOTYPE_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 12];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmcError {
    #[error("PEM parse error: {0}")]
    Pem(String),
    #[error("X.509 parse error: {0}")]
    X509(String),
    #[error("logotype extension not found")]
    MissingLogotype,
    #[error("no base64 data URI in logotype extension")]
    MissingDataUri,
    #[error("invalid base64 in logotype data")]
    Base64,
    #[error("gzip decode failed: {0}")]
    Gzip(String),
    #[error("indicator is not valid UTF-8")]
    Encoding,
}

/// Extracted VMC content.
#[derive(Debug, Clone)]
pub struct Vmc {
    /// subjectAltName dNSNames, e.g. `default._bimi.example.com`.
    pub alt_names: Vec<String>,
    /// The embedded SVG indicator, gunzipped when necessary.
    pub svg: String,
}

/// Parse a PEM-encoded VMC and extract names and indicator.
pub fn parse_vmc(pem_data: &[u8]) -> Result<Vmc, VmcError> {
    let (_, pem) = parse_x509_pem(pem_data).map_err(|e| VmcError::Pem(e.to_string()))?;
    if pem.label != "CERTIFICATE" {
        return Err(VmcError::Pem(format!("unexpected PEM label: {}", pem.label)));
    }
    let (_, cert) =
        X509Certificate::from_der(&pem.contents).map_err(|e| VmcError::X509(e.to_string()))?;

    let alt_names = subject_dns_names(&cert)?;
    let svg = extract_indicator(&cert)?;

    Ok(Vmc { alt_names, svg })
}

fn subject_dns_names(cert: &X509Certificate<'_>) -> Result<Vec<String>, VmcError> {
    let san = cert
        .tbs_certificate
        .subject_alternative_name()
        .map_err(|e| VmcError::X509(format!("SAN: {e}")))?;

    Ok(san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default())
}

/// Find the first `data:…;base64,` URI in the logotype extension and
/// decode its payload to SVG text.
fn extract_indicator(cert: &X509Certificate<'_>) -> Result<String, VmcError> {
    let oid =
        Oid::from(LOGOTYPE_OID).map_err(|_| VmcError::X509("invalid logotype OID".into()))?;
    let ext = cert
        .tbs_certificate
        .get_extension_unique(&oid)
        .map_err(|e| VmcError::X509(format!("logotype: {e}")))?
        .ok_or(VmcError::MissingLogotype)?;

    // The extension is nested ASN.1; scanning the raw bytes for the
    // data URI sidesteps the LogotypeData structure entirely.
    let raw = ext.value;
    let data_pos = find(raw, b"data:").ok_or(VmcError::MissingDataUri)?;
    let after_scheme = &raw[data_pos..];
    let b64_marker = find(after_scheme, b";base64,").ok_or(VmcError::MissingDataUri)?;
    let b64_start = data_pos + b64_marker + b";base64,".len();

    let b64: Vec<u8> = raw[b64_start..]
        .iter()
        .copied()
        .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        .collect();
    if b64.is_empty() {
        return Err(VmcError::MissingDataUri);
    }

    let payload = STANDARD.decode(&b64).map_err(|_| VmcError::Base64)?;
    let svg_bytes = gunzip_if_needed(payload)?;
    String::from_utf8(svg_bytes).map_err(|_| VmcError::Encoding)
}

/// Logotype payloads are conventionally gzipped SVG; plain SVG is
/// accepted too.
fn gunzip_if_needed(payload: Vec<u8>) -> Result<Vec<u8>, VmcError> {
    if payload.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(payload.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| VmcError::Gzip(e.to_string()))?;
        Ok(out)
    } else {
        Ok(payload)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rcgen::{CertificateParams, CustomExtension, KeyPair, SanType};
    use std::io::Write;

    const TEST_SVG: &str = r#"<svg xmlns="http://www.w3.org/2000/svg" version="1.2" baseProfile="tiny-ps" viewBox="0 0 64 64"><title>Mark</title><circle cx="32" cy="32" r="30"/></svg>"#;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn vmc_pem(logotype: Option<&[u8]>, san: &str) -> String {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .subject_alt_names
            .push(SanType::DnsName(san.try_into().unwrap()));
        if let Some(content) = logotype {
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(
                    LOGOTYPE_OID,
                    content.to_vec(),
                ));
        }
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    fn data_uri(media: &str, payload: &[u8]) -> Vec<u8> {
        format!("data:{media};base64,{}", STANDARD.encode(payload)).into_bytes()
    }

    #[test]
    fn extracts_gzipped_indicator_and_names() {
        let uri = data_uri("image/svg+xml+gzip", &gzip(TEST_SVG.as_bytes()));
        let pem = vmc_pem(Some(&uri), "default._bimi.example.com");

        let vmc = parse_vmc(pem.as_bytes()).unwrap();
        assert_eq!(vmc.svg, TEST_SVG);
        assert_eq!(vmc.alt_names, vec!["default._bimi.example.com"]);
    }

    #[test]
    fn extracts_plain_svg_indicator() {
        let uri = data_uri("image/svg+xml", TEST_SVG.as_bytes());
        let pem = vmc_pem(Some(&uri), "default._bimi.example.com");

        let vmc = parse_vmc(pem.as_bytes()).unwrap();
        assert_eq!(vmc.svg, TEST_SVG);
    }

    #[test]
    fn missing_logotype_extension() {
        let pem = vmc_pem(None, "default._bimi.example.com");
        assert_eq!(
            parse_vmc(pem.as_bytes()).unwrap_err(),
            VmcError::MissingLogotype
        );
    }

    #[test]
    fn extension_without_data_uri() {
        let pem = vmc_pem(Some(b"no uri in here"), "default._bimi.example.com");
        assert_eq!(
            parse_vmc(pem.as_bytes()).unwrap_err(),
            VmcError::MissingDataUri
        );
    }

    #[test]
    fn truncated_gzip_reports_gzip_error() {
        let mut bad = gzip(TEST_SVG.as_bytes());
        bad.truncate(6);
        let uri = data_uri("image/svg+xml+gzip", &bad);
        let pem = vmc_pem(Some(&uri), "default._bimi.example.com");

        assert!(matches!(
            parse_vmc(pem.as_bytes()).unwrap_err(),
            VmcError::Gzip(_)
        ));
    }

    #[test]
    fn not_pem_is_error() {
        assert!(matches!(
            parse_vmc(b"garbage").unwrap_err(),
            VmcError::Pem(_)
        ));
    }
}
