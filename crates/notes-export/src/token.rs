//! Placeholder tokens embedded in exported note content.
//!
//! Store-local references (attachment URLs, note ids in links) do not survive
//! an export. They are replaced by tokens carrying portable data:
//!
//! - `//-media:<file>-//` names a media file at the archive root.
//! - `//-link:<bookType>:<bookOwner>:<name>-//` names a note by [`PortableRef`].
//!
//! Every field is percent-encoded, so a token never contains `/` or a bare
//! `:` inside a field, and the token grammar stays unambiguous.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

use notes_core::{BookType, PortableRef};

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"//-(media|link):([A-Za-z0-9%._~:\-]*?)-//").expect("token regex is valid")
});

/// A portable placeholder found in, or written to, note content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PlaceholderToken {
    /// Media file stored at the archive root under `file_name`.
    Media { file_name: String },
    /// Link to another note.
    Link(PortableRef),
}

impl PlaceholderToken {
    pub fn media(file_name: impl Into<String>) -> Self {
        PlaceholderToken::Media {
            file_name: file_name.into(),
        }
    }

    pub fn link(target: PortableRef) -> Self {
        PlaceholderToken::Link(target)
    }

    /// Parse a complete token string. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        let caps = TOKEN_RE.captures(s)?;
        let whole = caps.get(0)?;
        if whole.start() != 0 || whole.end() != s.len() {
            return None;
        }
        Self::from_parts(caps.get(1)?.as_str(), caps.get(2)?.as_str())
    }

    fn from_parts(kind: &str, payload: &str) -> Option<Self> {
        match kind {
            "media" => {
                let file_name = decode(payload)?;
                if file_name.is_empty() {
                    return None;
                }
                Some(PlaceholderToken::Media { file_name })
            }
            "link" => {
                let mut fields = payload.splitn(3, ':');
                let book_type = decode(fields.next()?)?.parse::<BookType>().ok()?;
                let book_owner = decode(fields.next()?)?;
                let name = decode(fields.next()?)?;
                if name.is_empty() {
                    return None;
                }
                Some(PlaceholderToken::Link(PortableRef {
                    book_type,
                    book_owner,
                    name,
                }))
            }
            _ => None,
        }
    }
}

impl fmt::Display for PlaceholderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaceholderToken::Media { file_name } => {
                write!(f, "//-media:{}-//", urlencoding::encode(file_name))
            }
            PlaceholderToken::Link(target) => write!(
                f,
                "//-link:{}:{}:{}-//",
                urlencoding::encode(target.book_type.as_str()),
                urlencoding::encode(&target.book_owner),
                urlencoding::encode(&target.name)
            ),
        }
    }
}

fn decode(field: &str) -> Option<String> {
    urlencoding::decode(field).ok().map(Cow::into_owned)
}

/// Every well-formed token in `content`, with its byte range.
pub fn find_tokens(content: &str) -> Vec<(Range<usize>, PlaceholderToken)> {
    TOKEN_RE
        .captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let token = PlaceholderToken::from_parts(caps.get(1)?.as_str(), caps.get(2)?.as_str())?;
            Some((whole.range(), token))
        })
        .collect()
}

/// Whether `s` is, as a whole, a placeholder token.
pub fn is_token(s: &str) -> bool {
    PlaceholderToken::parse(s).is_some()
}

/// Replace tokens in `content` with the value returned by `resolve`.
///
/// Tokens for which `resolve` returns `None`, and malformed tokens, are kept
/// verbatim.
pub fn replace_tokens<F>(content: &str, mut resolve: F) -> String
where
    F: FnMut(&PlaceholderToken) -> Option<String>,
{
    let mut out = String::with_capacity(content.len());
    let mut last = 0;
    for (range, token) in find_tokens(content) {
        if let Some(replacement) = resolve(&token) {
            out.push_str(&content[last..range.start]);
            out.push_str(&replacement);
            last = range.end;
        }
    }
    out.push_str(&content[last..]);
    out
}
