//! Domain handling: normalization, IDN conversion, organizational
//! domains, and email-address splitting.

/// Lowercase and strip the trailing dot.
pub fn normalize(domain: &str) -> String {
    let d = domain.to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

/// Convert a domain to A-label (ASCII) form for DNS.
///
/// Everything handed to the resolver goes through here; user-facing
/// comments keep the original form.
pub fn to_ascii(domain: &str) -> Result<String, String> {
    let normalized = normalize(domain);
    if normalized.is_ascii() {
        return Ok(normalized);
    }
    idna::domain_to_ascii(&normalized).map_err(|e| format!("IDN conversion failed: {e}"))
}

/// Hostname syntax check, applied before every DNS query.
///
/// Leading underscores are allowed: `_dmarc`, `_domainkey`, `_bimi`,
/// and `_spf` labels are all legitimate query names.
pub fn is_valid_hostname(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

/// Compare two domains after normalization.
pub fn domains_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Check if `child` is a strict subdomain of `parent`.
pub fn is_subdomain_of(child: &str, parent: &str) -> bool {
    let nc = normalize(child);
    let np = normalize(parent);
    if nc == np {
        return false;
    }
    nc.ends_with(&format!(".{np}"))
}

/// Domain part of an email address (text after the last `@`).
pub fn domain_from_email(email: &str) -> Option<&str> {
    email.rsplit_once('@').map(|(_, domain)| domain)
}

/// Local part of an email address; the whole string if no `@`.
pub fn local_part_from_email(email: &str) -> &str {
    match email.rsplit_once('@') {
        Some((local, _)) => local,
        None => email,
    }
}

/// Organizational domain: public suffix plus one label.
///
/// `mail.example.com` → `example.com`, `foo.bar.co.uk` → `bar.co.uk`.
/// Uses the `psl` crate's embedded snapshot; unknown suffixes fall back
/// to the normalized input.
pub fn organizational_domain(domain: &str) -> String {
    let normalized = normalize(domain);
    match psl::domain_str(&normalized) {
        Some(org) => org.to_string(),
        None => normalized,
    }
}
