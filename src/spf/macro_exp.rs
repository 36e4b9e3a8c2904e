//! SPF macro expansion (RFC 7208 §7).
//!
//! Macro letters are case-sensitive: uppercase forms URL-encode the
//! expansion. `%{c}`, `%{r}`, and `%{t}` are only legal inside `exp=`
//! text.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Values the macro letters draw from.
pub struct MacroContext<'a> {
    /// Envelope sender, `postmaster@…` completed.
    pub sender: &'a str,
    pub local_part: &'a str,
    pub sender_domain: &'a str,
    /// Domain currently under evaluation (changes across redirects).
    pub domain: &'a str,
    pub client_ip: IpAddr,
    pub helo: &'a str,
    /// Receiving MTA hostname, for `%{r}`.
    pub receiver: &'a str,
}

/// Expand macros in a domain-spec or exp text.
pub fn expand(spec: &str, ctx: &MacroContext<'_>, exp_context: bool) -> Result<String, String> {
    let mut result = String::with_capacity(spec.len());
    let mut chars = spec.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => result.push('%'),
            Some('_') => result.push(' '),
            Some('-') => result.push_str("%20"),
            Some('{') => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => body.push(ch),
                        None => return Err("unterminated macro".into()),
                    }
                }
                result.push_str(&expand_macro(&body, ctx, exp_context)?);
            }
            _ => return Err(format!("stray % in macro string: {spec}")),
        }
    }

    Ok(result)
}

fn expand_macro(body: &str, ctx: &MacroContext<'_>, exp_context: bool) -> Result<String, String> {
    let mut chars = body.chars();
    let letter = chars.next().ok_or("empty macro body")?;
    let upper = letter.is_ascii_uppercase();

    let raw = match letter.to_ascii_lowercase() {
        's' => ctx.sender.to_string(),
        'l' => ctx.local_part.to_string(),
        'o' => ctx.sender_domain.to_string(),
        'd' => ctx.domain.to_string(),
        'i' => ip_macro(ctx.client_ip),
        // Validated reverse hostname; this engine does no PTR work.
        'p' => "unknown".to_string(),
        'v' => match ctx.client_ip {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        'h' => ctx.helo.to_string(),
        'c' if exp_context => ctx.client_ip.to_string(),
        'r' if exp_context => ctx.receiver.to_string(),
        't' if exp_context => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string(),
        'c' | 'r' | 't' => {
            return Err(format!("macro %{{{letter}}} only allowed in exp text"))
        }
        other => return Err(format!("unknown macro letter: {other}")),
    };

    let rest: String = chars.collect();
    let (digits, reverse, delimiters) = parse_transformers(&rest)?;

    let delims = if delimiters.is_empty() {
        ".".to_string()
    } else {
        delimiters
    };

    let mut parts: Vec<&str> = split_by_delimiters(&raw, &delims);
    if reverse {
        parts.reverse();
    }
    if digits > 0 && parts.len() > digits {
        parts = parts.split_off(parts.len() - digits);
    }
    let expanded = parts.join(".");

    Ok(if upper { url_encode(&expanded) } else { expanded })
}

/// `%{i}`: dotted quads for IPv4, dotted nibbles for IPv6.
fn ip_macro(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for segment in v6.segments() {
                for shift in [12u32, 8, 4, 0] {
                    nibbles.push(format!("{:x}", (segment >> shift) & 0xf));
                }
            }
            nibbles.join(".")
        }
    }
}

fn parse_transformers(s: &str) -> Result<(usize, bool, String), String> {
    let mut chars = s.chars().peekable();

    let mut digit_str = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digit_str.push(c);
            chars.next();
        } else {
            break;
        }
    }
    let digits = if digit_str.is_empty() {
        0
    } else {
        digit_str
            .parse()
            .map_err(|_| "invalid digit count in macro".to_string())?
    };

    let mut reverse = false;
    if chars.peek() == Some(&'r') {
        reverse = true;
        chars.next();
    }

    let mut delimiters = String::new();
    for c in chars {
        match c {
            '.' | '-' | '+' | ',' | '/' | '_' | '=' => delimiters.push(c),
            other => return Err(format!("invalid macro delimiter: {other}")),
        }
    }

    Ok((digits, reverse, delimiters))
}

fn split_by_delimiters<'a>(s: &'a str, delims: &str) -> Vec<&'a str> {
    let mut parts = vec![s];
    for delim in delims.chars() {
        parts = parts
            .into_iter()
            .flat_map(|part| part.split(delim))
            .collect();
    }
    parts
}

fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
