//! RFC 5322 message splitting: header block + opaque body bytes.
//!
//! Header values keep their original bytes (folding included) because
//! `simple` canonicalization must reproduce them exactly.

use crate::error::AuthError;

/// One logical header field.
#[derive(Debug, Clone)]
pub struct HeaderField {
    /// Field name with original casing.
    pub name: String,
    /// Lowercased field name, used for lookups.
    pub lower: String,
    /// Everything after the colon, byte-exact. Folded continuation
    /// lines are retained as `\r\n` + original leading whitespace.
    pub value: String,
}

impl HeaderField {
    pub fn is(&self, name: &str) -> bool {
        self.lower == name
    }
}

/// A parsed message: ordered headers plus the raw body.
#[derive(Debug)]
pub struct Message<'a> {
    pub headers: Vec<HeaderField>,
    pub body: &'a [u8],
}

impl<'a> Message<'a> {
    /// Split a raw message at the first blank line.
    ///
    /// Handles CRLF and bare-LF line endings. A message without the
    /// blank separator is rejected as [`AuthError::MalformedMessage`].
    pub fn parse(data: &'a [u8]) -> Result<Self, AuthError> {
        let (header_end, body_start) = find_separator(data)
            .ok_or_else(|| AuthError::MalformedMessage("no header/body separator".into()))?;

        let header_text = String::from_utf8_lossy(&data[..header_end]);
        let headers = parse_header_block(&header_text)?;

        Ok(Message {
            headers,
            body: &data[body_start..],
        })
    }

    /// All headers whose lowercased name equals `name`, top-down,
    /// with their positions in the header list.
    pub fn headers_named<'s>(
        &'s self,
        name: &'s str,
    ) -> impl Iterator<Item = (usize, &'s HeaderField)> + 's {
        self.headers
            .iter()
            .enumerate()
            .filter(move |(_, h)| h.lower == name)
    }

    /// First header with the given lowercased name.
    pub fn first(&self, name: &str) -> Option<&HeaderField> {
        self.headers.iter().find(|h| h.lower == name)
    }

    /// Headers as `(name, value)` pairs for canonicalization helpers.
    pub fn as_pairs(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .map(|h| (h.name.as_str(), h.value.as_str()))
            .collect()
    }
}

/// Locate the blank line. Returns `(end_of_headers, start_of_body)`.
fn find_separator(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            // "\n\r\n" / "\n\n" — the line after this one is blank
            if data[i + 1..].starts_with(b"\r\n") {
                return Some((i + 1, i + 3));
            }
            if data[i + 1..].starts_with(b"\n") {
                return Some((i + 1, i + 2));
            }
        }
        i += 1;
    }
    None
}

fn parse_header_block(text: &str) -> Result<Vec<HeaderField>, AuthError> {
    let mut headers: Vec<HeaderField> = Vec::new();

    for line in split_lines(text) {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation; re-attach with original bytes.
            match headers.last_mut() {
                Some(last) => {
                    last.value.push_str("\r\n");
                    last.value.push_str(line);
                }
                None => {
                    return Err(AuthError::MalformedMessage(
                        "continuation line before first header".into(),
                    ))
                }
            }
        } else if let Some(colon) = line.find(':') {
            let name = &line[..colon];
            headers.push(HeaderField {
                name: name.to_string(),
                lower: name.to_ascii_lowercase(),
                value: line[colon + 1..].to_string(),
            });
        } else {
            // Tolerated: some MTAs emit stray lines. They carry no
            // field name, so nothing can sign or select them.
            continue;
        }
    }

    Ok(headers)
}

/// Split on CRLF or LF without consuming other control bytes.
fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l))
}
