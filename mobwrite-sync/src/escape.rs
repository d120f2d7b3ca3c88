//! URL escaping used by the wire protocol.
//!
//! The escape set mirrors JavaScript's `encodeURI`, which is what browser
//! clients use for raw dumps and delta insertions: alphanumerics, a handful
//! of marks and the URI reserved characters pass through untouched, and
//! everything else (control characters, `%`, non-ASCII) is percent-encoded
//! as UTF-8. A literal space also passes through.

use std::str::Utf8Error;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters that `escape` leaves alone are removed from this set.
const URI_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b';')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b',')
    .remove(b'#')
    .remove(b' ');

/// Stricter set for turning document names into file names.
const FILE_NAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'.').remove(b'-');

/// Percent-encode text for a protocol line.
pub fn escape(text: &str) -> String {
    utf8_percent_encode(text, URI_ESCAPE).to_string()
}

/// Decode percent escapes, replacing invalid UTF-8 sequences.
///
/// `+` is never treated as a space.
pub fn unescape(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

/// Decode percent escapes, failing on invalid UTF-8.
pub fn try_unescape(text: &str) -> Result<String, Utf8Error> {
    percent_decode_str(text)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
}

/// Encode a document name so it is safe as a single path component.
pub fn escape_file_name(name: &str) -> String {
    utf8_percent_encode(name, FILE_NAME_ESCAPE).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_keeps_uri_characters() {
        assert_eq!(escape("a b/c?d=e&f+g"), "a b/c?d=e&f+g");
    }

    #[test]
    fn test_escape_encodes_controls_and_unicode() {
        assert_eq!(escape("a\tb\nc%"), "a%09b%0Ac%25");
        assert_eq!(escape("é"), "%C3%A9");
    }

    #[test]
    fn test_unescape_leaves_plus_alone() {
        assert_eq!(unescape("1+1%3D2"), "1+1=2");
        assert_eq!(unescape("%C3%A9t%C3%A9"), "été");
    }

    #[test]
    fn test_try_unescape_rejects_bad_utf8() {
        assert!(try_unescape("%FF%FE").is_err());
        assert_eq!(unescape("%FF"), "\u{FFFD}");
    }

    #[test]
    fn test_file_name_escape() {
        assert_eq!(escape_file_name("alice/proj/a b.txt"), "alice%2Fproj%2Fa%20b.txt");
    }
}
