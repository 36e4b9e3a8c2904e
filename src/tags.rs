//! DKIM-style `tag=value; tag=value` list parsing (RFC 6376 §3.2).
//!
//! Both the trimmed value and the raw bytes are retained: signing
//! round-trips must reproduce received order and spacing exactly.

use crate::error::AuthError;

/// A single `name=value` pair as it appeared on the wire.
#[derive(Debug, Clone)]
pub struct Tag {
    /// Lowercased tag name.
    pub name: String,
    /// Value with surrounding folding whitespace removed.
    pub value: String,
    /// The raw `name=value` text, untouched.
    pub raw: String,
}

/// Ordered tag list. Lookup is by lowercased name; iteration yields
/// received order.
#[derive(Debug, Clone, Default)]
pub struct TagList {
    tags: Vec<Tag>,
}

impl TagList {
    /// Parse a header value into tags.
    ///
    /// Accepts loose whitespace. Tag names match
    /// `[A-Za-z][A-Za-z0-9_]*`; values run to the next unquoted `;` or
    /// end of input. Empty values are permitted and preserved.
    /// Duplicate tags are rejected.
    pub fn parse(input: &str) -> Result<Self, AuthError> {
        let mut tags: Vec<Tag> = Vec::new();

        for part in input.split(';') {
            if part.trim_matches(is_fws).is_empty() {
                // Trailing semicolon or empty segment.
                continue;
            }
            let (name_raw, value_raw) = part.split_once('=').ok_or_else(|| {
                AuthError::MalformedTagList(format!("tag without '=': {}", part.trim()))
            })?;

            let name = name_raw.trim_matches(is_fws);
            if !is_valid_tag_name(name) {
                return Err(AuthError::MalformedTagList(format!(
                    "invalid tag name: {name:?}"
                )));
            }
            let name = name.to_ascii_lowercase();
            if tags.iter().any(|t| t.name == name) {
                return Err(AuthError::MalformedTagList(format!("duplicate tag: {name}")));
            }

            tags.push(Tag {
                name,
                value: value_raw.trim_matches(is_fws).to_string(),
                raw: part.to_string(),
            });
        }

        Ok(TagList { tags })
    }

    /// Trimmed value of a tag, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    /// Like [`TagList::get`] but with interior folding whitespace
    /// removed as well — for base64 values that may be wrapped.
    pub fn get_unfolded(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|v| v.chars().filter(|c| !c.is_whitespace()).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

fn is_fws(c: char) -> bool {
    c == ' ' || c == '\t' || c == '\r' || c == '\n'
}

fn is_valid_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tags_in_order() {
        let list = TagList::parse("v=1; a=rsa-sha256; d=example.com").unwrap();
        let names: Vec<&str> = list.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["v", "a", "d"]);
        assert_eq!(list.get("a"), Some("rsa-sha256"));
    }

    #[test]
    fn names_lowercased_for_lookup() {
        let list = TagList::parse("V=1; D=Example.COM").unwrap();
        assert_eq!(list.get("v"), Some("1"));
        assert_eq!(list.get("d"), Some("Example.COM"));
    }

    #[test]
    fn empty_value_preserved() {
        let list = TagList::parse("v=DKIM1; p=").unwrap();
        assert_eq!(list.get("p"), Some(""));
    }

    #[test]
    fn folded_value_trimmed_at_edges() {
        let list = TagList::parse("h= from : to ;\r\n\tbh= abc ").unwrap();
        assert_eq!(list.get("h"), Some("from : to"));
        assert_eq!(list.get("bh"), Some("abc"));
    }

    #[test]
    fn unfolded_strips_interior_fws() {
        let list = TagList::parse("b=AAAA\r\n BBBB CCCC").unwrap();
        assert_eq!(list.get_unfolded("b").unwrap(), "AAAABBBBCCCC");
    }

    #[test]
    fn duplicate_tag_rejected() {
        assert!(matches!(
            TagList::parse("v=1; v=2"),
            Err(AuthError::MalformedTagList(_))
        ));
    }

    #[test]
    fn invalid_tag_name_rejected() {
        assert!(TagList::parse("1v=x").is_err());
        assert!(TagList::parse("=x").is_err());
    }

    #[test]
    fn raw_text_retained() {
        let list = TagList::parse(" v=1 ;  a=rsa-sha256").unwrap();
        let raw: Vec<&str> = list.iter().map(|t| t.raw.as_str()).collect();
        assert_eq!(raw, [" v=1 ", "  a=rsa-sha256"]);
    }

    #[test]
    fn trailing_semicolon_tolerated() {
        let list = TagList::parse("v=1;").unwrap();
        assert_eq!(list.get("v"), Some("1"));
    }
}
