// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! RFC 6901 JSON Pointers, as used by patch operations.

use serde_json::Value;

/// A parsed JSON Pointer.
///
/// Tokens are stored unescaped; `Display` re-escapes (`~` → `~0`, `/` → `~1`)
/// so the round trip is exact. The empty pointer (whole document) is rejected
/// at parse time — patches always target a named location.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Pointer {
    tokens: Vec<String>,
}

/// Errors from parsing a pointer string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    /// Pointer did not start with `/`.
    #[error("pointer must start with '/': {path:?}")]
    MissingLeadingSlash {
        /// The offending input.
        path: String,
    },
    /// Pointer was empty (whole-document target).
    #[error("empty pointer targets the whole document")]
    Empty,
    /// A `~` escape was not `~0` or `~1`.
    #[error("bad escape in pointer token: {token:?}")]
    BadEscape {
        /// The offending token, still escaped.
        token: String,
    },
}

impl Pointer {
    /// Parses an RFC 6901 pointer such as `/enforcement/violations_count`.
    ///
    /// # Errors
    ///
    /// Returns [`PointerError`] for an empty pointer, a missing leading
    /// slash, or a malformed `~` escape.
    pub fn parse(path: &str) -> Result<Self, PointerError> {
        if path.is_empty() {
            return Err(PointerError::Empty);
        }
        let Some(rest) = path.strip_prefix('/') else {
            return Err(PointerError::MissingLeadingSlash {
                path: path.to_string(),
            });
        };
        let mut tokens = Vec::new();
        for raw in rest.split('/') {
            tokens.push(unescape(raw)?);
        }
        Ok(Pointer { tokens })
    }

    /// The unescaped reference tokens, root-first.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// The final token — the leaf name or array index being addressed.
    #[must_use]
    pub fn leaf_token(&self) -> &str {
        // Parse guarantees at least one token.
        self.tokens.last().map_or("", String::as_str)
    }

    /// Tokens of every ancestor container, root-first (excludes the leaf).
    #[must_use]
    pub fn ancestor_tokens(&self) -> &[String] {
        &self.tokens[..self.tokens.len() - 1]
    }

    /// Resolves the pointer against a value, if every step exists.
    #[must_use]
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for token in &self.tokens {
            current = step(current, token)?;
        }
        Some(current)
    }

    /// Resolves the parent container of the addressed location.
    #[must_use]
    pub fn resolve_parent<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for token in self.ancestor_tokens() {
            current = step(current, token)?;
        }
        Some(current)
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for token in &self.tokens {
            write!(f, "/{}", escape(token))?;
        }
        Ok(())
    }
}

/// Interprets a token as an index into an array of `len` elements.
///
/// Accepts `0..=len` (where `len` appends) and the RFC 6902 `-` append
/// token. Leading zeros are rejected per RFC 6901.
#[must_use]
pub fn array_index(token: &str, len: usize) -> Option<usize> {
    if token == "-" {
        return Some(len);
    }
    if token.len() > 1 && token.starts_with('0') {
        return None;
    }
    let idx: usize = token.parse().ok()?;
    (idx <= len).then_some(idx)
}

/// Returns `true` when the token is numeric (or `-`), i.e. addresses an
/// array element rather than an object key.
#[must_use]
pub fn is_index_token(token: &str) -> bool {
    token == "-" || (!token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
}

fn step<'a>(current: &'a Value, token: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(token),
        Value::Array(items) => {
            let idx = array_index(token, items.len())?;
            items.get(idx)
        }
        _ => None,
    }
}

fn unescape(raw: &str) -> Result<String, PointerError> {
    if !raw.contains('~') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => {
                return Err(PointerError::BadEscape {
                    token: raw.to_string(),
                })
            }
        }
    }
    Ok(out)
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_displays_round_trip() {
        let p = Pointer::parse("/metrics/closed_loops_total").unwrap();
        assert_eq!(p.tokens(), ["metrics", "closed_loops_total"]);
        assert_eq!(p.to_string(), "/metrics/closed_loops_total");
    }

    #[test]
    fn unescapes_rfc6901_sequences() {
        let p = Pointer::parse("/a~1b/c~0d").unwrap();
        assert_eq!(p.tokens(), ["a/b", "c~d"]);
        assert_eq!(p.to_string(), "/a~1b/c~0d");
    }

    #[test]
    fn rejects_bad_pointers() {
        assert!(matches!(Pointer::parse(""), Err(PointerError::Empty)));
        assert!(matches!(
            Pointer::parse("no-slash"),
            Err(PointerError::MissingLeadingSlash { .. })
        ));
        assert!(matches!(
            Pointer::parse("/bad~2escape"),
            Err(PointerError::BadEscape { .. })
        ));
    }

    #[test]
    fn resolves_through_objects_and_arrays() {
        let doc = json!({"a": {"b": [10, 20, 30]}});
        let p = Pointer::parse("/a/b/1").unwrap();
        assert_eq!(p.resolve(&doc), Some(&json!(20)));
        assert_eq!(p.resolve_parent(&doc), Some(&json!([10, 20, 30])));
        assert!(Pointer::parse("/a/x").unwrap().resolve(&doc).is_none());
    }

    #[test]
    fn array_index_accepts_append_forms() {
        assert_eq!(array_index("0", 3), Some(0));
        assert_eq!(array_index("3", 3), Some(3));
        assert_eq!(array_index("-", 3), Some(3));
        assert_eq!(array_index("4", 3), None);
        assert_eq!(array_index("01", 3), None);
        assert_eq!(array_index("x", 3), None);
    }
}
